//! Periodic execution of registered jobs under distributed locks.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info};

use vesper_lock::{DistributedLock, Lease, LockError, LockStore};

use crate::error::{JobError, SchedulerError};
use crate::job::{Job, is_structured, lock_resources};
use crate::metrics::MetricsReporter;
use crate::state::StateStore;

/// Most recent settled run of a job.
#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    /// Wall-clock start of the run.
    pub started_at: DateTime<Utc>,
    /// Whether the run settled successfully.
    pub success: bool,
    /// How long the body took, excluding the minimum hold.
    pub duration_ms: u64,
    /// The failure description when `success` is false.
    pub error: Option<String>,
}

/// Registry snapshot entry for one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub interval_ms: u64,
    /// Everything the job locks while running, its own name first.
    pub resources: Vec<String>,
    pub last_run: Option<LastRun>,
}

/// Drives a fixed registry of jobs on independent timers.
///
/// Each registered job gets its own recurring timer. Every tick spawns
/// one execution attempt, which races the distributed lock against all
/// other replicas and against any overlapping attempt in this process.
/// Losing the race skips the tick. Winning runs the job with its last
/// persisted state, persists a structured result, and records metrics.
///
/// A runner is started once and shut down once; the registry cannot
/// change in between.
pub struct Runner {
    inner: Arc<RunnerInner>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

struct RunnerInner {
    jobs: Vec<Arc<dyn Job>>,
    lock: DistributedLock,
    states: Arc<dyn StateStore>,
    metrics: Arc<dyn MetricsReporter>,
    last_runs: DashMap<String, LastRun>,
}

impl Runner {
    /// Builds a runner over a fixed job registry and its collaborators.
    ///
    /// Job names must be unique and intervals positive; no further
    /// registration happens after construction.
    pub fn new(
        jobs: Vec<Arc<dyn Job>>,
        lock_store: Arc<dyn LockStore>,
        states: Arc<dyn StateStore>,
        metrics: Arc<dyn MetricsReporter>,
    ) -> Result<Self, SchedulerError> {
        let mut names = HashSet::new();
        for job in &jobs {
            if job.interval().is_zero() {
                return Err(SchedulerError::ZeroInterval(job.name().to_string()));
            }
            if !names.insert(job.name().to_string()) {
                return Err(SchedulerError::DuplicateJob(job.name().to_string()));
            }
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(RunnerInner {
                jobs,
                lock: DistributedLock::new(lock_store),
                states,
                metrics,
                last_runs: DashMap::new(),
            }),
            shutdown_tx,
            started: AtomicBool::new(false),
            timers: Mutex::new(Vec::new()),
        })
    }

    /// Arms one recurring timer per registered job.
    ///
    /// The first tick fires immediately, giving every job one prompt
    /// attempt at startup; later ticks follow the job's interval.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut timers = self.timers.lock().await;
        if self.started.swap(true, Ordering::SeqCst) || *self.shutdown_tx.borrow() {
            return Err(SchedulerError::AlreadyStarted);
        }

        for job in &self.inner.jobs {
            timers.push(self.spawn_timer(job.clone()));
        }

        info!(
            count = timers.len(),
            lock_label = %self.inner.lock.label(),
            "runner started"
        );
        Ok(())
    }

    /// Stops all timers and waits for them to wind down.
    ///
    /// In-flight attempts are not aborted: they finish their body and
    /// their minimum hold, then release their locks. No new ticks fire
    /// after this returns.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let mut timers = self.timers.lock().await;
        if timers.is_empty() {
            return;
        }

        for timer in timers.drain(..) {
            if let Err(e) = timer.await {
                error!(error = %e, "timer task panicked");
            }
        }

        info!("runner shut down");
    }

    /// Spawns one extra attempt for `name`, outside its timer cadence.
    ///
    /// The attempt contends for the distributed lock like any tick, so
    /// a trigger inside the previous run's hold window is skipped. The
    /// returned handle resolves once the attempt has fully settled,
    /// minimum hold included.
    pub fn trigger(&self, name: &str) -> Result<JoinHandle<()>, SchedulerError> {
        let job = self
            .inner
            .jobs
            .iter()
            .find(|job| job.name() == name)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound(name.to_string()))?;

        info!(job = %name, "manual trigger");
        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            inner.attempt(job.as_ref()).await;
        }))
    }

    /// Snapshot of the registry with each job's most recent settled
    /// run.
    pub fn job_infos(&self) -> Vec<JobInfo> {
        self.inner
            .jobs
            .iter()
            .map(|job| JobInfo {
                name: job.name().to_string(),
                interval_ms: job.interval().as_millis() as u64,
                resources: lock_resources(job.as_ref()),
                last_run: self.last_run(job.name()),
            })
            .collect()
    }

    /// Most recent settled run of `name`, if it has run at all.
    pub fn last_run(&self, name: &str) -> Option<LastRun> {
        self.inner
            .last_runs
            .get(name)
            .map(|entry| entry.value().clone())
    }

    fn spawn_timer(&self, job: Arc<dyn Job>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(job.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!(job = %job.name(), "timer stopped");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        // Attempts are detached: a slow run must not
                        // stall this job's ticks, let alone another's.
                        let inner = inner.clone();
                        let job = job.clone();
                        tokio::spawn(async move {
                            inner.attempt(job.as_ref()).await;
                        });
                    }
                }
            }
        })
    }
}

impl RunnerInner {
    /// One execution attempt for one tick of `job`.
    ///
    /// Never fails upward: a lost lock race or a failed body settles
    /// here, and the timers keep going.
    #[tracing::instrument(skip(self, job), fields(name = %job.name()))]
    async fn attempt(&self, job: &dyn Job) {
        let resources = lock_resources(job);
        let ttl = job.interval();

        let outcome = self
            .lock
            .with_lock(&resources, ttl, |lease| self.execute(job, lease))
            .await;

        match outcome {
            Ok(()) => {}
            Err(LockError::Contended(resource)) => {
                debug!(job = %job.name(), resource = %resource, "tick skipped, lock held elsewhere");
            }
            Err(e) => {
                error!(job = %job.name(), error = %e, "tick skipped, lock acquisition failed");
            }
        }
    }

    /// Runs the job inside a held lock scope: metrics, state handoff,
    /// and the minimum hold.
    async fn execute(&self, job: &dyn Job, lease: Lease) {
        let name = job.name();
        info!(job = %name, "executing job");
        self.metrics.report_started(name);

        let started_at = Utc::now();
        let started = Instant::now();
        // The lock stays held for a full interval even when the body
        // finishes early, so a fast run cannot free the resources
        // before the intended spacing has passed.
        let min_hold = sleep(job.interval());

        let result = self.run_once(job, &lease).await;
        let elapsed = started.elapsed();

        let (success, error) = match result {
            Ok(()) => {
                info!(job = %name, elapsed_ms = elapsed.as_millis() as u64, "job completed");
                (true, None)
            }
            Err(e) => {
                error!(
                    job = %name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "job failed"
                );
                (false, Some(e.to_string()))
            }
        };

        self.metrics.report_completed(name, success);
        self.metrics.observe_duration(name, elapsed);
        self.last_runs.insert(
            name.to_string(),
            LastRun {
                started_at,
                success,
                duration_ms: elapsed.as_millis() as u64,
                error,
            },
        );

        min_hold.await;
    }

    /// State load, body, conditional persist. Failures settle in the
    /// caller; nothing is persisted for a failed run.
    async fn run_once(&self, job: &dyn Job, lease: &Lease) -> Result<(), JobError> {
        let previous = self.states.get_state(job.name()).await?;
        let next = job.run(lease, previous).await?;

        if let Some(state) = next.filter(|state| is_structured(state)) {
            self.states.set_state(job.name(), state).await?;
        }

        Ok(())
    }
}
