//! Per-job execution metrics.

use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// Default metric namespace.
const NAMESPACE: &str = "vesper";

/// Sink for per-job execution metrics.
///
/// Reporters are side-effect only and infallible: a metrics problem
/// must never change the outcome of a job attempt. Implementations
/// swallow or log their own failures.
pub trait MetricsReporter: Send + Sync {
    /// A run obtained the lock and is about to execute.
    fn report_started(&self, job: &str);

    /// A run settled, successfully or not.
    fn report_completed(&self, job: &str, success: bool);

    /// Wall-clock duration of a settled run.
    fn observe_duration(&self, job: &str, duration: Duration);
}

/// Reporter that drops every event, for embedders that do not scrape.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl MetricsReporter for NoopReporter {
    fn report_started(&self, _job: &str) {}

    fn report_completed(&self, _job: &str, _success: bool) {}

    fn observe_duration(&self, _job: &str, _duration: Duration) {}
}

/// Reporter backed by prometheus counters and histograms, labeled by
/// job name.
///
/// The scrape endpoint is the embedder's concern; this type only
/// registers its collectors against the supplied registry.
#[derive(Clone)]
pub struct PrometheusReporter {
    started: IntCounterVec,
    completed: IntCounterVec,
    duration_seconds: HistogramVec,
}

impl PrometheusReporter {
    /// Creates the collectors under the default namespace and
    /// registers them with `registry`.
    ///
    /// Fails when another collector already claimed the same names.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Self::with_namespace(registry, NAMESPACE)
    }

    /// Same collectors under a caller-chosen metric namespace, for
    /// embedders that already reserve a prefix of their own.
    pub fn with_namespace(registry: &Registry, namespace: &str) -> prometheus::Result<Self> {
        let started = IntCounterVec::new(
            Opts::new(
                format!("{namespace}_job_started_total"),
                "Job runs that obtained the lock and began executing",
            ),
            &["job"],
        )?;

        let completed = IntCounterVec::new(
            Opts::new(
                format!("{namespace}_job_completed_total"),
                "Settled job runs by outcome",
            ),
            &["job", "success"],
        )?;

        let duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{namespace}_job_duration_seconds"),
                "Wall-clock duration of settled job runs in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]),
            &["job"],
        )?;

        registry.register(Box::new(started.clone()))?;
        registry.register(Box::new(completed.clone()))?;
        registry.register(Box::new(duration_seconds.clone()))?;

        Ok(Self {
            started,
            completed,
            duration_seconds,
        })
    }
}

impl MetricsReporter for PrometheusReporter {
    fn report_started(&self, job: &str) {
        self.started.with_label_values(&[job]).inc();
    }

    fn report_completed(&self, job: &str, success: bool) {
        let outcome = if success { "true" } else { "false" };
        self.completed.with_label_values(&[job, outcome]).inc();
    }

    fn observe_duration(&self, job: &str, duration: Duration) {
        self.duration_seconds
            .with_label_values(&[job])
            .observe(duration.as_secs_f64());
    }
}
