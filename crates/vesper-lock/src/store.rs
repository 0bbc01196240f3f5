//! Coordination store backends.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use crate::error::StoreError;

/// Coordination backend for distributed locks.
///
/// Implementations decide how replicas agree on ownership. The
/// in-memory store below serves single-node deployments and tests;
/// networked backends (Redis, a database table, a consensus group)
/// implement the same three operations over the wire. Every held
/// resource carries a TTL so a dead holder cannot wedge the fleet.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Attempts to take `resource` for `holder` until `ttl` elapses.
    ///
    /// Returns `false` when another live holder already owns it. An
    /// acquire by the current holder refreshes the TTL and succeeds.
    async fn try_acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Pushes the expiry of a held resource further out.
    ///
    /// Returns `false` when `holder` no longer owns `resource`, either
    /// because the TTL lapsed or because someone else took it after.
    async fn extend(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Releases a held resource.
    ///
    /// Releasing something `holder` does not own is a no-op: the lock
    /// may have lapsed and been taken by another holder, and removing
    /// their entry would break exclusion.
    async fn release(&self, resource: &str, holder: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct LockEntry {
    holder: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Process-local [`LockStore`] backed by a concurrent map.
///
/// Expiry is lazy: a lapsed entry counts as absent and is overwritten
/// by the next acquirer. Sharing one instance between several runners
/// emulates a fleet of replicas sharing a coordination store, which is
/// how the integration tests exercise cross-replica exclusion.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: DashMap<String, LockEntry>,
}

impl MemoryLockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live holder of `resource`, if any. Exposed for diagnostics.
    pub fn holder_of(&self, resource: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .get(resource)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.holder.clone())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let fresh = LockEntry {
            holder: holder.to_string(),
            expires_at: now + ttl,
        };

        // The entry guard holds the shard lock across check and set.
        match self.entries.entry(resource.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) || entry.holder == holder {
                    *entry = fresh;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn extend(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.entries.get_mut(resource) {
            Some(mut entry) if entry.holder == holder && !entry.is_expired(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, resource: &str, holder: &str) -> Result<(), StoreError> {
        self.entries
            .remove_if(resource, |_, entry| entry.holder == holder);
        Ok(())
    }
}
