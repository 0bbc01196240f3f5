//! Persisted per-job state.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::StateError;

/// Persistence boundary for job state blobs.
///
/// State is keyed by job name and opaque to the store; jobs define and
/// validate their own shapes. There is no transactional coupling to
/// the distributed lock: a crash between computing and persisting a
/// state loses that increment, and the next run sees the older blob.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Last persisted state for `job`, if any.
    async fn get_state(&self, job: &str) -> Result<Option<Value>, StateError>;

    /// Overwrites the state for `job`.
    async fn set_state(&self, job: &str, state: Value) -> Result<(), StateError>;
}

/// Process-local [`StateStore`] backed by a concurrent map.
///
/// Does not survive restarts; deployments that need durable resume
/// points back this boundary with real storage instead.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: DashMap<String, Value>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_state(&self, job: &str) -> Result<Option<Value>, StateError> {
        Ok(self.states.get(job).map(|entry| entry.value().clone()))
    }

    async fn set_state(&self, job: &str, state: Value) -> Result<(), StateError> {
        self.states.insert(job.to_string(), state);
        Ok(())
    }
}
