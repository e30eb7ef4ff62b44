//! State Refresher
//!
//! A refresher performs exactly one "get" against the remote system for a
//! bound resource handle and classifies what it saw. It never retries; the
//! poller owns the loop.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::status::{Observed, StatusClass, StatusClassifier, StatusReason};

/// Opaque identifier the remote system assigned to a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(String);

impl ResourceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceHandle {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ResourceHandle {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for ResourceHandle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One classified look at a remote resource
#[derive(Debug, Clone, PartialEq)]
pub struct Observation<T> {
    /// The fetched snapshot; `None` when the resource has vanished
    pub value: Option<T>,
    pub status: String,
    pub class: StatusClass,
    pub reasons: Vec<StatusReason>,
}

impl<T> Observation<T> {
    pub fn new(value: Option<T>, status: impl Into<String>, class: StatusClass) -> Self {
        Self {
            value,
            status: status.into(),
            class,
            reasons: Vec::new(),
        }
    }

    pub fn with_reasons(mut self, reasons: Vec<StatusReason>) -> Self {
        self.reasons = reasons;
        self
    }

    /// The resource no longer exists and the caller expected that
    pub fn vanished(label: impl Into<String>) -> Self {
        Self::new(None, label, StatusClass::Success)
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("resource {handle} not found")]
    NotFound { handle: ResourceHandle },

    #[error("error getting {handle}: {source}")]
    Remote {
        handle: ResourceHandle,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RefreshError {
    pub fn remote(
        handle: ResourceHandle,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Remote {
            handle,
            source: Box::new(source),
        }
    }
}

/// Error returned by a Resource Client call
pub trait RemoteError: std::error::Error + Send + Sync + 'static {
    /// The remote side reported that the resource does not exist (HTTP 404)
    fn is_not_found(&self) -> bool;
}

/// What a refresh should conclude when the resource is gone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFound {
    /// Existence is expected; a missing resource is a fatal error
    Fail,
    /// The caller is waiting for deletion; report this terminal label
    Vanished(String),
}

#[async_trait]
pub trait StateRefresher: Send {
    type Value: Send;

    /// Handle of the resource this refresher is bound to
    fn handle(&self) -> &ResourceHandle;

    async fn refresh(&mut self) -> Result<Observation<Self::Value>, RefreshError>;
}

/// Refresher bound to one resource handle and a typed fetch call
pub struct ResourceRefresher<'a, F, T> {
    handle: ResourceHandle,
    fetch: F,
    classifier: Arc<dyn StatusClassifier>,
    not_found: NotFound,
    observer: Option<Box<dyn FnMut(&T) + Send + 'a>>,
}

impl<'a, F, T> ResourceRefresher<'a, F, T> {
    pub fn new(
        handle: impl Into<ResourceHandle>,
        classifier: Arc<dyn StatusClassifier>,
        fetch: F,
    ) -> Self {
        Self {
            handle: handle.into(),
            fetch,
            classifier,
            not_found: NotFound::Fail,
            observer: None,
        }
    }

    pub fn on_not_found(mut self, policy: NotFound) -> Self {
        self.not_found = policy;
        self
    }

    /// Called with every fetched snapshot, before classification
    pub fn observe(mut self, observer: impl FnMut(&T) + Send + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }
}

#[async_trait]
impl<'a, F, Fut, T, E> StateRefresher for ResourceRefresher<'a, F, T>
where
    F: FnMut(ResourceHandle) -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Observed + Send,
    E: RemoteError,
{
    type Value = T;

    fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    async fn refresh(&mut self) -> Result<Observation<T>, RefreshError> {
        match (self.fetch)(self.handle.clone()).await {
            Ok(value) => {
                if let Some(observer) = self.observer.as_mut() {
                    observer(&value);
                }
                let status = value.status().to_string();
                let class = self.classifier.classify(&status);
                let reasons = value.status_reasons().to_vec();
                Ok(Observation::new(Some(value), status, class).with_reasons(reasons))
            }
            Err(e) if e.is_not_found() => match &self.not_found {
                NotFound::Vanished(label) => Ok(Observation::vanished(label.clone())),
                NotFound::Fail => Err(RefreshError::NotFound {
                    handle: self.handle.clone(),
                }),
            },
            Err(e) => Err(RefreshError::remote(self.handle.clone(), e)),
        }
    }
}

/// Refresher backed by a closure that produces observations directly
pub struct FnRefresher<F> {
    handle: ResourceHandle,
    f: F,
}

pub fn refresh_fn<F>(handle: impl Into<ResourceHandle>, f: F) -> FnRefresher<F> {
    FnRefresher {
        handle: handle.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut, T> StateRefresher for FnRefresher<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Observation<T>, RefreshError>> + Send,
    T: Send,
{
    type Value = T;

    fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    async fn refresh(&mut self) -> Result<Observation<T>, RefreshError> {
        (self.f)().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusTable;

    #[derive(Debug, Clone)]
    struct Disk {
        status: String,
    }

    impl Observed for Disk {
        fn status(&self) -> &str {
            &self.status
        }
    }

    #[derive(Debug, Error)]
    #[error("status {0}")]
    struct FakeError(u16);

    impl RemoteError for FakeError {
        fn is_not_found(&self) -> bool {
            self.0 == 404
        }
    }

    fn table() -> Arc<dyn StatusClassifier> {
        Arc::new(StatusTable::new().success(["available"]).failed(["failed"]))
    }

    #[tokio::test]
    async fn classifies_fetched_status() {
        let mut refresher = ResourceRefresher::new("vol-1", table(), |_h: ResourceHandle| async {
            Ok::<_, FakeError>(Disk {
                status: "available".to_string(),
            })
        });

        let observation = refresher.refresh().await.unwrap();
        assert_eq!(observation.status, "available");
        assert_eq!(observation.class, StatusClass::Success);
        assert!(observation.value.is_some());
    }

    #[tokio::test]
    async fn not_found_is_fatal_by_default() {
        let mut refresher = ResourceRefresher::new("vol-1", table(), |_h: ResourceHandle| async {
            Err::<Disk, _>(FakeError(404))
        });

        let err = refresher.refresh().await.unwrap_err();
        assert!(matches!(err, RefreshError::NotFound { .. }));
    }

    #[tokio::test]
    async fn not_found_maps_to_vanished_label() {
        let mut refresher = ResourceRefresher::new("vol-1", table(), |_h: ResourceHandle| async {
            Err::<Disk, _>(FakeError(404))
        })
        .on_not_found(NotFound::Vanished("deleted".to_string()));

        let observation = refresher.refresh().await.unwrap();
        assert_eq!(observation.status, "deleted");
        assert_eq!(observation.class, StatusClass::Success);
        assert!(observation.value.is_none());
    }

    #[tokio::test]
    async fn other_errors_are_remote_errors() {
        let mut refresher = ResourceRefresher::new("vol-1", table(), |_h: ResourceHandle| async {
            Err::<Disk, _>(FakeError(500))
        })
        .on_not_found(NotFound::Vanished("deleted".to_string()));

        let err = refresher.refresh().await.unwrap_err();
        assert!(err.to_string().contains("vol-1"));
        assert!(matches!(err, RefreshError::Remote { .. }));
    }

    #[tokio::test]
    async fn observer_sees_every_snapshot() {
        let mut seen = Vec::new();
        {
            let mut refresher =
                ResourceRefresher::new("vol-1", table(), |_h: ResourceHandle| async {
                    Ok::<_, FakeError>(Disk {
                        status: "pending".to_string(),
                    })
                })
                .observe(|disk: &Disk| seen.push(disk.status.clone()));

            refresher.refresh().await.unwrap();
            refresher.refresh().await.unwrap();
        }
        assert_eq!(seen, vec!["pending".to_string(), "pending".to_string()]);
    }
}
