//! Scoped lock acquisition.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tracing::warn;
use uuid::Uuid;

use crate::error::LockError;
use crate::store::LockStore;

/// Prefix for autogenerated holder labels.
const HOLDER_PREFIX: &str = "vesper";

/// Ownership window handed to the body of a lock scope.
///
/// Expiry is advisory: the coordination store reclaims the resources on
/// its own schedule, and a long-running body can watch the lease to
/// wind down before that happens.
#[derive(Debug, Clone)]
pub struct Lease {
    acquired_at: Instant,
    ttl: Duration,
}

impl Lease {
    fn new(acquired_at: Instant, ttl: Duration) -> Self {
        Self { acquired_at, ttl }
    }

    /// Lease beginning at the current instant, unattached to any store.
    /// Handy for exercising a job body directly in tests.
    pub fn starting_now(ttl: Duration) -> Self {
        Self::new(Instant::now(), ttl)
    }

    /// The TTL the lock was acquired with.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Instant at which the coordination store may reclaim the lock.
    pub fn deadline(&self) -> Instant {
        self.acquired_at + self.ttl
    }

    /// Whether the ownership window has lapsed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }

    /// Time left before expiry, zero once lapsed.
    pub fn remaining(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }

    /// Resolves when the lease lapses. Useful in a `select!` against a
    /// long-running work loop.
    pub async fn expired(&self) {
        sleep_until(self.deadline()).await;
    }
}

/// Scoped, named, time-bounded mutual exclusion across replicas.
///
/// A scope covers a whole set of resource names or none of them: on a
/// partial acquisition every resource taken so far is handed back
/// before the attempt reports contention. Release happens on every
/// exit path of the scope. If the process dies mid-scope, the store's
/// TTL reclaims the resources instead.
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    label: String,
}

impl DistributedLock {
    /// Wrap a coordination store with an autogenerated holder label.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self::with_label(store, format!("{}-{}", HOLDER_PREFIX, Uuid::new_v4()))
    }

    /// Wrap a coordination store with a caller-chosen holder label,
    /// which shows up as the owner prefix in the store and in logs.
    pub fn with_label(store: Arc<dyn LockStore>, label: impl Into<String>) -> Self {
        Self {
            store,
            label: label.into(),
        }
    }

    /// The holder label of this lock handle.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Runs `body` while exclusively holding every name in `resources`.
    ///
    /// Duplicate names are collapsed and order is kept. Fails with
    /// [`LockError::Contended`] when any resource is already owned and
    /// with [`LockError::Store`] when the coordination store itself
    /// errors; `body` does not run in either case, and no retry is
    /// attempted here. The lease handed to `body` reflects `ttl` from
    /// just before the first acquire.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resources: &[String],
        ttl: Duration,
        body: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = T>,
    {
        let resources = dedup_preserving_order(resources);
        if resources.is_empty() {
            return Err(LockError::NoResources);
        }

        // One token per attempt, so two scopes from the same process
        // are never mistaken for a re-entrant acquire on a shared name.
        let holder = format!("{}#{}", self.label, Uuid::new_v4());

        // The lease clock starts before the first acquire, keeping its
        // deadline at or before the store's expiry for every resource.
        let acquired_at = Instant::now();
        self.acquire_all(&resources, &holder, ttl).await?;

        let output = body(Lease::new(acquired_at, ttl)).await;

        self.release_all(&resources, &holder).await;
        Ok(output)
    }

    /// Acquires every resource in order, rolling back on the first
    /// denial or store failure.
    async fn acquire_all(
        &self,
        resources: &[String],
        holder: &str,
        ttl: Duration,
    ) -> Result<(), LockError> {
        for (index, resource) in resources.iter().enumerate() {
            let taken = match self.store.try_acquire(resource, holder, ttl).await {
                Ok(taken) => taken,
                Err(e) => {
                    self.release_all(&resources[..index], holder).await;
                    return Err(LockError::Store(e));
                }
            };

            if !taken {
                self.release_all(&resources[..index], holder).await;
                return Err(LockError::Contended(resource.clone()));
            }
        }

        Ok(())
    }

    /// Best-effort release; the TTL reclaims anything left behind.
    async fn release_all(&self, resources: &[String], holder: &str) {
        for resource in resources {
            if let Err(e) = self.store.release(resource, holder).await {
                warn!(resource = %resource, error = %e, "failed to release lock resource");
            }
        }
    }
}

fn dedup_preserving_order(resources: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    resources
        .iter()
        .filter(|resource| seen.insert(resource.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryLockStore;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use proptest::prelude::*;

    const TTL: Duration = Duration::from_secs(30);

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    /// Store whose every operation fails, as if the backend is down.
    struct FailingStore;

    #[async_trait]
    impl LockStore for FailingStore {
        async fn try_acquire(
            &self,
            _resource: &str,
            _holder: &str,
            _ttl: Duration,
        ) -> Result<bool, StoreError> {
            Err(StoreError::new("backend down"))
        }

        async fn extend(
            &self,
            _resource: &str,
            _holder: &str,
            _ttl: Duration,
        ) -> Result<bool, StoreError> {
            Err(StoreError::new("backend down"))
        }

        async fn release(&self, _resource: &str, _holder: &str) -> Result<(), StoreError> {
            Err(StoreError::new("backend down"))
        }
    }

    /// Store that errors only for one poisoned resource name.
    struct FailOnResource {
        inner: MemoryLockStore,
        poisoned: String,
    }

    #[async_trait]
    impl LockStore for FailOnResource {
        async fn try_acquire(
            &self,
            resource: &str,
            holder: &str,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            if resource == self.poisoned {
                return Err(StoreError::new("backend down"));
            }
            self.inner.try_acquire(resource, holder, ttl).await
        }

        async fn extend(
            &self,
            resource: &str,
            holder: &str,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            self.inner.extend(resource, holder, ttl).await
        }

        async fn release(&self, resource: &str, holder: &str) -> Result<(), StoreError> {
            self.inner.release(resource, holder).await
        }
    }

    /// Store that acquires fine but always fails to release.
    struct FailingRelease {
        inner: MemoryLockStore,
    }

    #[async_trait]
    impl LockStore for FailingRelease {
        async fn try_acquire(
            &self,
            resource: &str,
            holder: &str,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            self.inner.try_acquire(resource, holder, ttl).await
        }

        async fn extend(
            &self,
            resource: &str,
            holder: &str,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            self.inner.extend(resource, holder, ttl).await
        }

        async fn release(&self, _resource: &str, _holder: &str) -> Result<(), StoreError> {
            Err(StoreError::new("network blip"))
        }
    }

    // === Unit Tests ===

    #[tokio::test]
    async fn test_body_runs_while_resources_held() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = DistributedLock::with_label(store.clone(), "node-a");

        let store_ref = &store;
        let label = lock.label();
        let output = lock
            .with_lock(&names(&["gc"]), TTL, |_lease| async move {
                let holder = store_ref.holder_of("gc").expect("resource held in scope");
                assert!(holder.starts_with(label));
                7
            })
            .await
            .unwrap();

        assert_eq!(output, 7);
        assert_eq!(store.holder_of("gc"), None);
    }

    #[tokio::test]
    async fn test_autogenerated_label_carries_prefix() {
        let lock = DistributedLock::new(Arc::new(MemoryLockStore::new()));

        assert!(lock.label().starts_with("vesper-"));
    }

    #[tokio::test]
    async fn test_resources_released_after_scope() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = DistributedLock::with_label(store.clone(), "node-a");

        lock.with_lock(&names(&["gc", "tokens"]), TTL, |_lease| async {})
            .await
            .unwrap();

        assert_eq!(store.holder_of("gc"), None);
        assert_eq!(store.holder_of("tokens"), None);
    }

    #[tokio::test]
    async fn test_contended_resource_skips_body() {
        let store = Arc::new(MemoryLockStore::new());
        store.try_acquire("gc", "someone-else", TTL).await.unwrap();

        let lock = DistributedLock::with_label(store.clone(), "node-a");
        let ran = AtomicBool::new(false);
        let ran_ref = &ran;

        let result = lock
            .with_lock(&names(&["gc"]), TTL, |_lease| async move {
                ran_ref.store(true, Ordering::SeqCst);
            })
            .await;

        assert!(matches!(result, Err(LockError::Contended(ref r)) if r == "gc"));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(store.holder_of("gc"), Some("someone-else".to_string()));
    }

    #[tokio::test]
    async fn test_empty_resource_set_rejected() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = DistributedLock::with_label(store, "node-a");

        let result = lock.with_lock(&[], TTL, |_lease| async {}).await;

        assert!(matches!(result, Err(LockError::NoResources)));
    }

    #[tokio::test]
    async fn test_partial_acquisition_rolls_back() {
        let store = Arc::new(MemoryLockStore::new());
        store
            .try_acquire("shared", "someone-else", TTL)
            .await
            .unwrap();

        let lock = DistributedLock::with_label(store.clone(), "node-a");
        let result = lock
            .with_lock(&names(&["cleanup", "shared"]), TTL, |_lease| async {})
            .await;

        assert!(matches!(result, Err(LockError::Contended(ref r)) if r == "shared"));
        // The resource acquired before the denial was handed back.
        assert_eq!(store.holder_of("cleanup"), None);
    }

    #[tokio::test]
    async fn test_duplicate_names_collapse() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = DistributedLock::with_label(store.clone(), "node-a");

        lock.with_lock(&names(&["gc", "gc", "gc"]), TTL, |_lease| async {})
            .await
            .unwrap();

        assert_eq!(store.holder_of("gc"), None);
    }

    #[tokio::test]
    async fn test_scopes_on_shared_store_exclude() {
        let store = Arc::new(MemoryLockStore::new());
        let lock_a = DistributedLock::with_label(store.clone(), "node-a");
        let lock_b = DistributedLock::with_label(store.clone(), "node-b");

        let lock_b_ref = &lock_b;
        lock_a
            .with_lock(&names(&["gc"]), TTL, |_lease| async move {
                let denied = lock_b_ref
                    .with_lock(&names(&["gc"]), TTL, |_lease| async {})
                    .await;
                assert!(matches!(denied, Err(LockError::Contended(_))));
            })
            .await
            .unwrap();

        // Once the first scope exits, the other side gets through.
        lock_b
            .with_lock(&names(&["gc"]), TTL, |_lease| async {})
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_same_label_scopes_still_exclude() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = DistributedLock::with_label(store, "node-a");

        // Two attempts from one process must not look re-entrant.
        let lock_ref = &lock;
        lock.with_lock(&names(&["shared"]), TTL, |_lease| async move {
            let denied = lock_ref
                .with_lock(&names(&["shared"]), TTL, |_lease| async {})
                .await;
            assert!(matches!(denied, Err(LockError::Contended(_))));
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_distinctly() {
        let lock = DistributedLock::with_label(Arc::new(FailingStore), "node-a");
        let ran = AtomicBool::new(false);
        let ran_ref = &ran;

        let result = lock
            .with_lock(&names(&["gc"]), TTL, |_lease| async move {
                ran_ref.store(true, Ordering::SeqCst);
            })
            .await;

        assert!(matches!(result, Err(LockError::Store(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_store_failure_mid_set_rolls_back() {
        let store = Arc::new(FailOnResource {
            inner: MemoryLockStore::new(),
            poisoned: "boom".to_string(),
        });
        let lock = DistributedLock::with_label(store.clone(), "node-a");

        let result = lock
            .with_lock(&names(&["cleanup", "boom"]), TTL, |_lease| async {})
            .await;

        assert!(matches!(result, Err(LockError::Store(_))));
        assert_eq!(store.inner.holder_of("cleanup"), None);
    }

    #[tokio::test]
    async fn test_release_failure_does_not_fail_scope() {
        let store = Arc::new(FailingRelease {
            inner: MemoryLockStore::new(),
        });
        let lock = DistributedLock::with_label(store, "node-a");

        let output = lock
            .with_lock(&names(&["gc"]), TTL, |_lease| async { 42 })
            .await
            .unwrap();

        assert_eq!(output, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_tracks_expiry() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = DistributedLock::with_label(store, "node-a");
        let ttl = Duration::from_secs(5);

        lock.with_lock(&names(&["gc"]), ttl, |lease| async move {
            assert_eq!(lease.ttl(), ttl);
            assert!(!lease.is_expired());
            assert!(lease.remaining() <= ttl);

            tokio::time::advance(Duration::from_secs(6)).await;

            assert!(lease.is_expired());
            assert_eq!(lease.remaining(), Duration::ZERO);
            lease.expired().await;
        })
        .await
        .unwrap();
    }

    // === Property-Based Tests ===

    proptest! {
        // Composed resource sets keep first occurrences in order and
        // never contain a duplicate.
        #[test]
        fn dedup_keeps_first_occurrence_order(
            input in proptest::collection::vec("[a-z]{1,6}", 0..12),
        ) {
            let output = dedup_preserving_order(&input);

            let mut expected = Vec::new();
            let mut seen = HashSet::new();
            for name in &input {
                if seen.insert(name.clone()) {
                    expected.push(name.clone());
                }
            }

            prop_assert_eq!(output, expected);
        }

        // Deduplication never invents or loses distinct names.
        #[test]
        fn dedup_preserves_name_set(
            input in proptest::collection::vec("[a-z]{1,6}", 0..12),
        ) {
            let output = dedup_preserving_order(&input);

            let input_set: HashSet<_> = input.iter().collect();
            let output_set: HashSet<_> = output.iter().collect();

            prop_assert_eq!(input_set, output_set);
            prop_assert!(output.len() <= input.len());
        }
    }
}
