//! Scheduler metrics, grounded in the teacher's `OnceLock` +
//! `register_*_vec!` initialization pattern. Registration happens once
//! per process via [`init_metrics`]; callers elsewhere just read the
//! `OnceLock`s, so a metrics call before init is a silent no-op rather
//! than a panic.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};

pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();
pub static JOB_STEPS_TOTAL: OnceLock<CounterVec> = OnceLock::new();
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

static INIT_RESULT: OnceLock<Result<()>> = OnceLock::new();

/// Register every metric exactly once, process-wide. Safe to call more
/// than once — later calls observe the first call's result.
pub fn init_metrics() -> anyhow::Result<()> {
    match INIT_RESULT.get_or_init(init_metrics_internal) {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("engine metrics initialization failed: {e}")),
    }
}

fn init_metrics_internal() -> Result<()> {
    if JOBS_TOTAL.get().is_some() {
        return Ok(());
    }

    let jobs_total = register_counter_vec!(
        "loom_engine_jobs_total",
        "Total jobs processed by terminal status",
        &["status"]
    )
    .context("failed to register JOBS_TOTAL")?;

    let job_duration = register_histogram_vec!(
        "loom_engine_job_duration_seconds",
        "Job execution duration in seconds, from claim to terminal state",
        &["status"]
    )
    .context("failed to register JOB_DURATION")?;

    let job_steps_total = register_counter_vec!(
        "loom_engine_job_steps_total",
        "Total job steps processed by kind and status",
        &["step_type", "status"]
    )
    .context("failed to register JOB_STEPS_TOTAL")?;

    let queue_depth = register_gauge!("loom_engine_queue_depth", "Current depth of the worker job channel")
        .context("failed to register QUEUE_DEPTH")?;

    let active_workers = register_gauge!("loom_engine_active_workers", "Number of workers currently executing a job")
        .context("failed to register ACTIVE_WORKERS")?;

    JOBS_TOTAL.set(jobs_total).map_err(|_| anyhow::anyhow!("JOBS_TOTAL already initialized"))?;
    JOB_DURATION.set(job_duration).map_err(|_| anyhow::anyhow!("JOB_DURATION already initialized"))?;
    JOB_STEPS_TOTAL
        .set(job_steps_total)
        .map_err(|_| anyhow::anyhow!("JOB_STEPS_TOTAL already initialized"))?;
    QUEUE_DEPTH.set(queue_depth).map_err(|_| anyhow::anyhow!("QUEUE_DEPTH already initialized"))?;
    ACTIVE_WORKERS
        .set(active_workers)
        .map_err(|_| anyhow::anyhow!("ACTIVE_WORKERS already initialized"))?;

    Ok(())
}

pub fn record_job_terminal(status: &str, duration_secs: f64) {
    if let Some(counter) = JOBS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
    if let Some(histogram) = JOB_DURATION.get() {
        histogram.with_label_values(&[status]).observe(duration_secs);
    }
}

pub fn record_job_step(step_type: &str, status: &str) {
    if let Some(counter) = JOB_STEPS_TOTAL.get() {
        counter.with_label_values(&[step_type, status]).inc();
    }
}

pub fn set_queue_depth(depth: f64) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.set(depth);
    }
}

pub fn inc_active_workers() {
    if let Some(gauge) = ACTIVE_WORKERS.get() {
        gauge.inc();
    }
}

pub fn dec_active_workers() {
    if let Some(gauge) = ACTIVE_WORKERS.get() {
        gauge.dec();
    }
}

/// Render the process-wide registry in Prometheus text exposition
/// format. There is no HTTP surface in this crate to scrape it — an
/// embedding caller mounts this under its own `/metrics` route.
pub fn render() -> anyhow::Result<String> {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .context("failed to encode metrics")?;
    String::from_utf8(buffer).context("metrics output was not valid UTF-8")
}
