//! Error types for the scheduler.

use thiserror::Error;

/// Failure raised by a state store backend.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StateError(pub String);

impl StateError {
    /// Wrap a backend failure description.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors a job run can settle with.
///
/// These never propagate past the attempt that produced them: the
/// runner logs them, records a failure metric, and keeps going.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job's own work failed.
    #[error("{0}")]
    Failed(String),

    /// Reading or writing job state failed around the run.
    #[error("state store error: {0}")]
    State(#[from] StateError),

    /// The stored state blob did not match the shape the job expected.
    #[error("malformed job state: {0}")]
    MalformedState(#[from] serde_json::Error),
}

impl JobError {
    /// A plain work failure with a description.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors from building or driving the runner.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Two registered jobs share a name.
    #[error("duplicate job name: {0}")]
    DuplicateJob(String),

    /// A job declared a zero interval.
    #[error("job has zero interval: {0}")]
    ZeroInterval(String),

    /// No job registered under this name.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The runner's timers are already armed, or the runner was
    /// already shut down.
    #[error("runner already started")]
    AlreadyStarted,
}
