//! Keyed lock registry
//!
//! Serializes multi-call sequences against the same remote resource, such as
//! attaching a network interface and then binding its security groups.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::refresh::ResourceHandle;

/// Lock identity: a scope naming the kind of resource plus its handle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub scope: &'static str,
    pub handle: ResourceHandle,
}

impl LockKey {
    pub fn new(scope: &'static str, handle: impl Into<ResourceHandle>) -> Self {
        Self {
            scope,
            handle: handle.into(),
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scope, self.handle)
    }
}

/// Lock entries exist only while someone holds or waits on them
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`; released when the guard drops
    pub async fn lock(&self, key: &LockKey) -> LockGuard<'_> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        log::debug!("Acquiring lock {}", key);
        LockGuard {
            registry: self,
            key: key.clone(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one key of a [`LockRegistry`]
#[derive(Debug)]
pub struct LockGuard<'a> {
    registry: &'a LockRegistry,
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: no holder and no waiter
        self.registry
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fake client that panics if two calls overlap
    #[derive(Default)]
    struct ReentrancyCheck {
        busy: AtomicBool,
        calls: AtomicUsize,
    }

    impl ReentrancyCheck {
        async fn mutate(&self) {
            assert!(
                !self.busy.swap(true, Ordering::SeqCst),
                "overlapping mutating calls"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_never_overlaps() {
        let registry = Arc::new(LockRegistry::new());
        let client = Arc::new(ReentrancyCheck::default());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = registry.lock(&LockKey::new("instance", "i-1")).await;
                client.mutate().await;
                client.mutate().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(client.calls.load(Ordering::SeqCst), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_are_independent() {
        let registry = LockRegistry::new();
        let _a = registry.lock(&LockKey::new("instance", "i-1")).await;

        let wait = Duration::from_secs(1);
        let other_key = LockKey::new("instance", "i-2");
        let other = tokio::time::timeout(wait, registry.lock(&other_key));
        assert!(other.await.is_ok());
        let scoped_key = LockKey::new("volume", "i-1");
        let scoped = tokio::time::timeout(wait, registry.lock(&scoped_key));
        assert!(scoped.await.is_ok());
        let same_key = LockKey::new("instance", "i-1");
        let same = tokio::time::timeout(wait, registry.lock(&same_key));
        assert!(same.await.is_err());
    }

    #[tokio::test]
    async fn released_keys_leave_the_registry() {
        let registry = LockRegistry::new();
        let held = registry.lock(&LockKey::new("instance", "i-1")).await;
        drop(registry.lock(&LockKey::new("instance", "i-2")).await);
        assert_eq!(registry.len(), 1);

        drop(held);
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_distinct_keys_do_not_accumulate() {
        let registry = Arc::new(LockRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let key = LockKey::new("instance", format!("i-{}", i % 4));
                let _guard = registry.lock(&key).await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_keeps_entry_after_holder_releases() {
        let registry = Arc::new(LockRegistry::new());
        let key = LockKey::new("instance", "i-1");
        let held = registry.lock(&key).await;

        let waiter = {
            let registry = registry.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = registry.lock(&key).await;
                tokio::time::sleep(Duration::from_secs(1)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(held);
        assert_eq!(registry.len(), 1);
        waiter.await.unwrap();
        assert!(registry.is_empty());
    }
}
