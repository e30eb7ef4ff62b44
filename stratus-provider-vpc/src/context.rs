//! Shared handler context
//!
//! Every handler receives a [`VpcContext`]: the Resource Client, the lock
//! registry shared by all operations of one provider, the poll pacing and the
//! caller's cancellation token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use stratus_core::lock::LockRegistry;
use stratus_core::poller::{PollSettings, Poller, WaitConfig};
use stratus_core::provider::{BoxFuture, ProviderError, ProviderResult};
use stratus_core::refresh::{ResourceHandle, ResourceRefresher};
use stratus_core::resource::{ResourceId, Value};
use stratus_core::status::{StatusClassifier, StatusReason};
use tokio_util::sync::CancellationToken;

use crate::client::{ApiError, ApiResult, VpcClient};

/// Boxed typed "get" call bound to a client
pub(crate) type Fetch<T> = Box<dyn FnMut(ResourceHandle) -> BoxFuture<'static, ApiResult<T>> + Send>;

/// Refresher used by every handler wait
pub(crate) type Refresher<'a, T> = ResourceRefresher<'a, Fetch<T>, T>;

#[derive(Clone)]
pub struct VpcContext {
    pub client: Arc<dyn VpcClient>,
    pub locks: Arc<LockRegistry>,
    pub poll: PollSettings,
    pub cancel: Option<CancellationToken>,
}

impl VpcContext {
    pub fn new(client: Arc<dyn VpcClient>) -> Self {
        Self {
            client,
            locks: Arc::new(LockRegistry::new()),
            poll: PollSettings::default(),
            cancel: None,
        }
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Poller paced by this context and stopped by its cancellation token
    pub fn poller<P, T, S1, S2>(&self, pending: P, target: T, timeout: Duration) -> Poller
    where
        P: IntoIterator<Item = S1>,
        T: IntoIterator<Item = S2>,
        S1: Into<String>,
        S2: Into<String>,
    {
        let config = WaitConfig::new(pending, target, timeout).with_poll_settings(&self.poll);
        Poller::new(config).with_cancellation(self.cancel.clone())
    }

    /// Refresher issuing `get` against this context's client
    pub(crate) fn refresher<'a, T, F, Fut>(
        &self,
        handle: impl Into<ResourceHandle>,
        classifier: Arc<dyn StatusClassifier>,
        get: F,
    ) -> Refresher<'a, T>
    where
        F: Fn(Arc<dyn VpcClient>, ResourceHandle) -> Fut + Send + 'static,
        Fut: Future<Output = ApiResult<T>> + Send + 'static,
        T: 'static,
    {
        let client = self.client.clone();
        let fetch: Fetch<T> = Box::new(move |handle: ResourceHandle| {
            Box::pin(get(client.clone(), handle)) as BoxFuture<'static, ApiResult<T>>
        });
        ResourceRefresher::new(handle, classifier, fetch)
    }
}

/// Attach the resource to an error crossing the provider boundary
pub(crate) trait ResourceResultExt<T> {
    fn for_resource(self, id: &ResourceId) -> ProviderResult<T>;
}

impl<T, E> ResourceResultExt<T> for Result<T, E>
where
    E: Into<ProviderError>,
{
    fn for_resource(self, id: &ResourceId) -> ProviderResult<T> {
        self.map_err(|e| e.into().for_resource(id.clone()))
    }
}

/// Handle of a sub-resource addressed through its parent: `parent/child`
pub(crate) fn child_handle(parent: &str, child: &str) -> ResourceHandle {
    ResourceHandle::new(format!("{}/{}", parent, child))
}

pub(crate) fn split_handle(handle: &ResourceHandle) -> ApiResult<(&str, &str)> {
    handle
        .as_str()
        .split_once('/')
        .filter(|(parent, child)| !parent.is_empty() && !child.is_empty())
        .ok_or_else(|| {
            ApiError::new(
                400,
                "invalid_id",
                format!("'{}' is not of the form parent_id/id", handle),
            )
        })
}

/// The resource was addressed without a remote identifier
pub(crate) fn missing_identifier(id: &ResourceId) -> ProviderError {
    ProviderError::new("resource has no remote identifier").for_resource(id.clone())
}

pub(crate) fn string_list<I, S>(items: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Value::List(items.into_iter().map(|s| Value::String(s.into())).collect())
}

pub(crate) fn reasons_value(reasons: &[StatusReason]) -> Value {
    Value::List(
        reasons
            .iter()
            .map(|r| {
                let mut map = std::collections::HashMap::from([
                    ("code".to_string(), Value::String(r.code.clone())),
                    ("message".to_string(), Value::String(r.message.clone())),
                ]);
                if let Some(more_info) = &r.more_info {
                    map.insert("more_info".to_string(), Value::String(more_info.clone()));
                }
                Value::Map(map)
            })
            .collect(),
    )
}

/// Observed list ordered like the configured one, extras last
///
/// Keeps a converged list from showing up as a change only because the remote
/// side returns members in a different order.
pub(crate) fn in_configured_order(configured: &[String], mut observed: Vec<String>) -> Vec<String> {
    let mut ordered: Vec<String> = configured
        .iter()
        .filter(|c| observed.contains(c))
        .cloned()
        .collect();
    observed.sort();
    ordered.extend(observed.into_iter().filter(|o| !configured.contains(o)));
    ordered
}
