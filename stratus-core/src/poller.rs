//! Convergence Poller
//!
//! Drives a [`StateRefresher`] on a fixed interval until the observed status
//! reaches a target label, the remote resource reports a failure, or the
//! wall-clock timeout elapses. An optional [`CorrectiveDriver`] runs next to
//! the poll and may end it early with its own error.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{self, error::Elapsed};
use tokio_util::sync::CancellationToken;

use crate::corrective::CorrectiveDriver;
use crate::provider::ProviderError;
use crate::refresh::{RefreshError, ResourceHandle, StateRefresher};
use crate::status::{StatusClass, StatusReason};

/// Default pause before the first refresh
pub const DEFAULT_DELAY: Duration = Duration::from_secs(10);
/// Default minimum spacing between refreshes
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(10);

/// Provider-wide poll pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub delay: Duration,
    pub min_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            delay: DEFAULT_DELAY,
            min_interval: DEFAULT_MIN_INTERVAL,
        }
    }
}

impl PollSettings {
    /// Same spacing for the initial delay and between refreshes
    pub fn every(interval: Duration) -> Self {
        Self {
            delay: interval,
            min_interval: interval,
        }
    }
}

/// Parameters of a single wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitConfig {
    /// Labels that keep the poll going. Empty means any non-target label.
    pub pending: Vec<String>,
    /// Labels that end the poll
    pub target: Vec<String>,
    pub timeout: Duration,
    pub delay: Duration,
    pub min_interval: Duration,
    pub poll_interval: Option<Duration>,
    /// Consecutive target observations required before returning
    pub continuous_target_occurrence: u32,
}

impl WaitConfig {
    pub fn new<P, T, S1, S2>(pending: P, target: T, timeout: Duration) -> Self
    where
        P: IntoIterator<Item = S1>,
        T: IntoIterator<Item = S2>,
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            pending: pending.into_iter().map(Into::into).collect(),
            target: target.into_iter().map(Into::into).collect(),
            timeout,
            delay: DEFAULT_DELAY,
            min_interval: DEFAULT_MIN_INTERVAL,
            poll_interval: None,
            continuous_target_occurrence: 1,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    pub fn with_continuous_target_occurrence(mut self, occurrences: u32) -> Self {
        self.continuous_target_occurrence = occurrences.max(1);
        self
    }

    pub fn with_poll_settings(self, settings: &PollSettings) -> Self {
        self.with_delay(settings.delay)
            .with_min_interval(settings.min_interval)
    }

    /// Spacing between two refreshes
    pub fn interval(&self) -> Duration {
        self.poll_interval
            .unwrap_or(self.min_interval)
            .max(self.min_interval)
    }

    fn is_target(&self, status: &str) -> bool {
        self.target.iter().any(|t| t == status)
    }

    fn is_pending(&self, status: &str) -> bool {
        self.pending.is_empty() || self.pending.iter().any(|p| p == status)
    }
}

/// Successful end of a wait
#[derive(Debug, Clone, PartialEq)]
pub struct Converged<T> {
    /// Last fetched snapshot, `None` when the resource vanished
    pub value: Option<T>,
    /// Terminal status label
    pub status: String,
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error("{handle} reached status '{status}'{}", render_reasons(.reasons))]
    Failed {
        handle: ResourceHandle,
        status: String,
        reasons: Vec<StatusReason>,
    },

    #[error("unexpected status '{status}' for {handle}, wanted one of {target:?}")]
    UnexpectedState {
        handle: ResourceHandle,
        status: String,
        target: Vec<String>,
    },

    #[error(
        "timeout while waiting for {handle} to become {target:?} (last status: '{last_status}', timeout: {timeout:?})"
    )]
    Timeout {
        handle: ResourceHandle,
        timeout: Duration,
        last_status: String,
        target: Vec<String>,
        #[source]
        source: Elapsed,
    },

    #[error("corrective action for {handle} failed: {source}")]
    Corrective {
        handle: ResourceHandle,
        #[source]
        source: ProviderError,
    },

    #[error("wait for {handle} was cancelled")]
    Cancelled { handle: ResourceHandle },
}

fn render_reasons(reasons: &[StatusReason]) -> String {
    if reasons.is_empty() {
        return String::new();
    }
    format!(
        ": {}",
        serde_json::to_string_pretty(reasons).unwrap_or_default()
    )
}

impl From<WaitError> for ProviderError {
    fn from(e: WaitError) -> Self {
        ProviderError::new(e.to_string()).with_cause(e)
    }
}

/// Polls one resource until it converges
#[derive(Clone)]
pub struct Poller {
    config: WaitConfig,
    corrective: Option<CorrectiveDriver>,
    cancel: Option<CancellationToken>,
}

impl Poller {
    pub fn new(config: WaitConfig) -> Self {
        Self {
            config,
            corrective: None,
            cancel: None,
        }
    }

    pub fn with_corrective(mut self, driver: Option<CorrectiveDriver>) -> Self {
        self.corrective = driver;
        self
    }

    /// Stop waiting when the caller cancels this token
    pub fn with_cancellation(mut self, cancel: Option<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    pub async fn poll_until_done<R>(
        &self,
        refresher: &mut R,
    ) -> Result<Converged<R::Value>, WaitError>
    where
        R: StateRefresher,
    {
        let handle = refresher.handle().clone();
        log::info!(
            "Waiting for {} to become {:?} (timeout {:?})",
            handle,
            self.config.target,
            self.config.timeout
        );

        // Cancelled exactly once when this poll ends, however it ends
        let signal = match &self.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        let (mut errors, task) = match &self.corrective {
            Some(driver) => {
                let (tx, rx) = oneshot::channel();
                let task = tokio::spawn(driver.clone().run(handle.clone(), signal.clone(), tx));
                (Some(rx), Some(task))
            }
            None => (None, None),
        };
        let guard = signal.clone().drop_guard();

        let mut last_status = String::new();
        let outcome = time::timeout(
            self.config.timeout,
            self.drive(refresher, &handle, &signal, errors.as_mut(), &mut last_status),
        )
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(elapsed) => Err(WaitError::Timeout {
                handle: handle.clone(),
                timeout: self.config.timeout,
                last_status,
                target: self.config.target.clone(),
                source: elapsed,
            }),
        };

        drop(guard);
        if let Some(task) = task
            && let Err(e) = task.await
        {
            log::warn!("Corrective action task for {} ended abnormally: {}", handle, e);
        }

        match &result {
            Ok(converged) => log::info!("{} reached '{}'", handle, converged.status),
            Err(e) => log::debug!("Wait for {} ended: {}", handle, e),
        }
        result
    }

    async fn drive<R>(
        &self,
        refresher: &mut R,
        handle: &ResourceHandle,
        signal: &CancellationToken,
        mut errors: Option<&mut oneshot::Receiver<ProviderError>>,
        last_status: &mut String,
    ) -> Result<Converged<R::Value>, WaitError>
    where
        R: StateRefresher,
    {
        let mut hits = 0;
        let mut wait = self.config.delay;

        loop {
            if !wait.is_zero() {
                pause(wait, handle, signal, &mut errors).await?;
            }
            wait = self.config.interval();

            let refreshed = refresher.refresh().await;

            if let Some(rx) = errors.as_deref_mut()
                && let Ok(source) = rx.try_recv()
            {
                return Err(WaitError::Corrective {
                    handle: handle.clone(),
                    source,
                });
            }
            let observation = refreshed?;

            log::debug!("{}: status '{}'", handle, observation.status);
            last_status.clone_from(&observation.status);

            if observation.class == StatusClass::Failed {
                return Err(WaitError::Failed {
                    handle: handle.clone(),
                    status: observation.status,
                    reasons: observation.reasons,
                });
            }

            // Success class is informational; the target set ends the wait
            if self.config.is_target(&observation.status) {
                hits += 1;
                if hits >= self.config.continuous_target_occurrence {
                    return Ok(Converged {
                        value: observation.value,
                        status: observation.status,
                    });
                }
                continue;
            }
            hits = 0;

            if !self.config.is_pending(&observation.status) {
                return Err(WaitError::UnexpectedState {
                    handle: handle.clone(),
                    status: observation.status,
                    target: self.config.target.clone(),
                });
            }
        }
    }
}

/// Sleep between refreshes, waking early for cancellation or a corrective error
///
/// A driver that ends without reporting leaves the poll running; `errors` is
/// cleared so the closed channel is not awaited again.
async fn pause(
    period: Duration,
    handle: &ResourceHandle,
    signal: &CancellationToken,
    errors: &mut Option<&mut oneshot::Receiver<ProviderError>>,
) -> Result<(), WaitError> {
    let sleep = time::sleep(period);
    tokio::pin!(sleep);

    loop {
        let corrective = async {
            match errors.as_deref_mut() {
                Some(rx) => rx.await.ok(),
                None => std::future::pending().await,
            }
        };

        let reported = tokio::select! {
            biased;
            _ = signal.cancelled() => {
                return Err(WaitError::Cancelled {
                    handle: handle.clone(),
                });
            }
            reported = corrective => reported,
            _ = &mut sleep => return Ok(()),
        };

        match reported {
            Some(source) => {
                return Err(WaitError::Corrective {
                    handle: handle.clone(),
                    source,
                });
            }
            None => *errors = None,
        }
    }
}
