//! Periodic job scheduling for Vesper.
//!
//! - [`Job`]: a named unit of recurring work with its own interval
//! - [`Runner`]: per-job timers, lock-guarded execution, shutdown
//! - [`StateStore`]: persisted per-job state for incremental resume
//! - [`MetricsReporter`]: success, failure, and duration reporting
//!
//! Replicas running the same registry against a shared lock store
//! coordinate through [`vesper_lock`]: every tick contends for the
//! job's resources, and losing replicas skip the tick.

mod error;
mod job;
mod metrics;
mod runner;
mod state;

pub use error::{JobError, SchedulerError, StateError};
pub use job::Job;
pub use metrics::{MetricsReporter, NoopReporter, PrometheusReporter};
pub use runner::{JobInfo, LastRun, Runner};
pub use state::{MemoryStateStore, StateStore};

pub use vesper_lock::{Lease, LockStore, MemoryLockStore, StoreError};
