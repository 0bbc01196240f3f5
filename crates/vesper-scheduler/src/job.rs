//! Job contract.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use vesper_lock::Lease;

use crate::error::JobError;

/// A named, periodically executed, resumable unit of background work.
///
/// Implementations are handed to the runner once at construction. The
/// runner owns scheduling, locking, state handoff, and metrics; a job
/// only describes itself and does the work. A job must tolerate seeing
/// the same previous state twice, since a crash between finishing work
/// and persisting the result redoes that increment on the next run.
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable identifier. Doubles as the lock resource name and the
    /// state store key, so it must be unique across the registry.
    fn name(&self) -> &str;

    /// Minimum spacing between the starts of two runs.
    fn interval(&self) -> Duration;

    /// Extra resource names that must be exclusively held while this
    /// job runs, for work that must not overlap with other jobs
    /// touching the same data. Defaults to none.
    fn additional_resources(&self) -> Vec<String> {
        Vec::new()
    }

    /// One run.
    ///
    /// `previous` is exactly what the last successful run returned, or
    /// `None` on a cold start. Returning a structured value (object or
    /// array) persists it as the new state; any other return leaves the
    /// stored state untouched. `lease` says how long the coordination
    /// store keeps other replicas out; long jobs can watch it to wind
    /// down before expiry.
    async fn run(&self, lease: &Lease, previous: Option<Value>) -> Result<Option<Value>, JobError>;
}

/// Full resource set a job holds while running: its own name first,
/// then any additional resources, duplicates collapsed.
pub(crate) fn lock_resources(job: &dyn Job) -> Vec<String> {
    let mut resources = vec![job.name().to_string()];
    for extra in job.additional_resources() {
        if !resources.contains(&extra) {
            resources.push(extra);
        }
    }
    resources
}

/// Whether a run's return value is persisted as the job's new state.
pub(crate) fn is_structured(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}
