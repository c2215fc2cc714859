//! Prometheus metrics for the fair queue
//!
//! This module tracks:
//! - Admission: admitted, deduplicated and rejected pushes per queue
//! - Dispatch: jobs handed out, released, discarded and recovered
//! - Worker loop: callback failures and currently running jobs
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, or it is never called, metrics operations become
//! no-ops.

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

struct QueueMetrics {
    admissions: CounterVec,
    duplicates: CounterVec,
    rejections: CounterVec,
    dispatches: CounterVec,
    releases: CounterVec,
    discarded: CounterVec,
    recovered: CounterVec,
    callback_failures: CounterVec,
    in_flight: GaugeVec,
    job_duration: HistogramVec,
}

static QUEUE_METRICS: OnceLock<QueueMetrics> = OnceLock::new();

static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers anything.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = fairq::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = QueueMetrics {
        admissions: register_counter_vec!(
            "fairq_admissions_total",
            "Jobs admitted into a host queue",
            &["queue"]
        )?,
        duplicates: register_counter_vec!(
            "fairq_duplicates_total",
            "Pushes ignored because the key was already queued",
            &["queue"]
        )?,
        rejections: register_counter_vec!(
            "fairq_rejections_total",
            "Pushes rejected by validation or backpressure",
            &["queue", "reason"]
        )?,
        dispatches: register_counter_vec!(
            "fairq_dispatches_total",
            "Jobs handed out by next()",
            &["queue"]
        )?,
        releases: register_counter_vec!(
            "fairq_releases_total",
            "Slots released after processing",
            &["queue"]
        )?,
        discarded: register_counter_vec!(
            "fairq_discarded_total",
            "Removed jobs skipped at dispatch time",
            &["queue"]
        )?,
        recovered: register_counter_vec!(
            "fairq_recovered_total",
            "In-flight jobs returned to their host queues by wake-up",
            &["queue"]
        )?,
        callback_failures: register_counter_vec!(
            "fairq_callback_failures_total",
            "Worker callbacks that returned an error or panicked",
            &["queue"]
        )?,
        in_flight: register_gauge_vec!(
            "fairq_worker_in_flight",
            "Jobs currently running in this process",
            &["queue"]
        )?,
        job_duration: register_histogram_vec!(
            "fairq_job_duration_seconds",
            "Callback execution time in seconds",
            &["queue"],
            vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        )?,
    };

    QUEUE_METRICS
        .set(metrics)
        .map_err(|_| "Queue metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    QUEUE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_admission(queue: &str) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.admissions.with_label_values(&[queue]).inc();
    }
}

pub fn record_duplicate(queue: &str) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.duplicates.with_label_values(&[queue]).inc();
    }
}

/// Record a rejected push, labelled by error category
pub fn record_rejection(queue: &str, reason: &str) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.rejections.with_label_values(&[queue, reason]).inc();
    }
}

pub fn record_dispatch(queue: &str) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.dispatches.with_label_values(&[queue]).inc();
    }
}

pub fn record_release(queue: &str) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.releases.with_label_values(&[queue]).inc();
    }
}

pub fn record_discarded(queue: &str) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.discarded.with_label_values(&[queue]).inc();
    }
}

pub fn record_recovered(queue: &str, count: usize) {
    let Some(m) = QUEUE_METRICS.get() else {
        return;
    };

    if count > 0 {
        m.recovered
            .with_label_values(&[queue])
            .inc_by(count as f64);
    }
}

pub fn record_callback_failure(queue: &str) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.callback_failures.with_label_values(&[queue]).inc();
    }
}

/// Set the number of jobs currently running in this process
pub fn set_in_flight(queue: &str, count: usize) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.in_flight.with_label_values(&[queue]).set(count as f64);
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start timing one callback execution
pub fn start_job_timer(queue: &str) -> MetricsTimer {
    match QUEUE_METRICS.get() {
        Some(m) => MetricsTimer::new(m.job_duration.with_label_values(&[queue]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================
