//! Corrective Action Driver
//!
//! Some remote state machines stall in an intermediate status with no
//! automatic recovery. A driver runs next to a poll and, every sub-interval
//! until the poll ends, issues one remedial command against the resource.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::provider::ProviderError;
use crate::refresh::ResourceHandle;

/// Longest accepted `force_recovery_time`: one year
pub const MAX_RECOVERY_MINUTES: i64 = 365 * 24 * 60;

/// A remedial command, such as force-stopping a stuck instance
#[async_trait]
pub trait CorrectiveAction: Send + Sync {
    async fn remediate(&self, handle: &ResourceHandle) -> Result<(), ProviderError>;

    /// Short human-readable description for logs
    fn describe(&self) -> String;
}

#[derive(Clone)]
pub struct CorrectiveDriver {
    action: Arc<dyn CorrectiveAction>,
    sub_interval: Duration,
}

impl std::fmt::Debug for CorrectiveDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrectiveDriver")
            .field("action", &self.action.describe())
            .field("sub_interval", &self.sub_interval)
            .finish()
    }
}

impl CorrectiveDriver {
    pub fn new(action: impl CorrectiveAction + 'static, sub_interval: Duration) -> Self {
        Self::from_arc(Arc::new(action), sub_interval)
    }

    pub fn from_arc(action: Arc<dyn CorrectiveAction>, sub_interval: Duration) -> Self {
        Self {
            action,
            sub_interval,
        }
    }

    /// Driver for a `force_recovery_time` setting; only positive minutes enable it
    ///
    /// Settings beyond [`MAX_RECOVERY_MINUTES`] are clamped to it.
    pub fn after_minutes(minutes: i64, action: Arc<dyn CorrectiveAction>) -> Option<Self> {
        (minutes > 0).then(|| {
            let minutes = minutes.min(MAX_RECOVERY_MINUTES) as u64;
            Self::from_arc(action, Duration::from_secs(minutes * 60))
        })
    }

    pub fn sub_interval(&self) -> Duration {
        self.sub_interval
    }

    /// Tick until `signal` is cancelled
    ///
    /// The first remediation error is sent on `errors` and ends the task.
    pub(crate) async fn run(
        self,
        handle: ResourceHandle,
        signal: CancellationToken,
        errors: oneshot::Sender<ProviderError>,
    ) {
        let mut ticker = time::interval_at(Instant::now() + self.sub_interval, self.sub_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = signal.cancelled() => return,
                _ = ticker.tick() => {}
            }

            log::warn!(
                "{} has not converged after {:?}, {}",
                handle,
                self.sub_interval,
                self.action.describe()
            );

            let result = tokio::select! {
                biased;
                _ = signal.cancelled() => return,
                result = self.action.remediate(&handle) => result,
            };

            if let Err(e) = result {
                log::warn!("Corrective action for {} failed: {}", handle, e);
                // The poll may already be over; nobody is left to tell
                let _ = errors.send(e);
                return;
            }
        }
    }
}
