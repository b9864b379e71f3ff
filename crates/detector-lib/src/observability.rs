//! Observability infrastructure for the anomaly detector
//!
//! Provides:
//! - Prometheus metrics (scoring latency, rows scored, reloads, model version, state)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<DetectorMetricsInner> = OnceLock::new();

struct DetectorMetricsInner {
    prediction_latency_seconds: Histogram,
    feature_latency_seconds: Histogram,
    rows_scored: IntCounter,
    anomalies_detected: IntCounter,
    prediction_errors: IntCounterVec,
    reload_attempts: IntCounter,
    reload_failures: IntCounter,
    model_version_info: GaugeVec,
    detector_state: IntGauge,
    inflight_predictions: IntGauge,
}

impl DetectorMetricsInner {
    fn new() -> Self {
        Self {
            prediction_latency_seconds: register_histogram!(
                "anomaly_detector_prediction_latency_seconds",
                "Time spent scoring a feature matrix with the loaded bundle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register prediction_latency_seconds"),

            feature_latency_seconds: register_histogram!(
                "anomaly_detector_feature_latency_seconds",
                "Time spent turning raw metrics into a feature matrix",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register feature_latency_seconds"),

            rows_scored: register_int_counter!(
                "anomaly_detector_rows_scored_total",
                "Total number of rows that received an ensemble score"
            )
            .expect("Failed to register rows_scored"),

            anomalies_detected: register_int_counter!(
                "anomaly_detector_anomalies_detected_total",
                "Total number of requests whose latest score crossed the threshold"
            )
            .expect("Failed to register anomalies_detected"),

            prediction_errors: register_int_counter_vec!(
                "anomaly_detector_prediction_errors_total",
                "Total number of failed prediction requests by error class",
                &["kind"]
            )
            .expect("Failed to register prediction_errors"),

            reload_attempts: register_int_counter!(
                "anomaly_detector_reload_attempts_total",
                "Total number of bundle load attempts"
            )
            .expect("Failed to register reload_attempts"),

            reload_failures: register_int_counter!(
                "anomaly_detector_reload_failures_total",
                "Total number of failed bundle load attempts"
            )
            .expect("Failed to register reload_failures"),

            model_version_info: register_gauge_vec!(
                "anomaly_detector_model_version_info",
                "Information about the currently loaded model bundle",
                &["version"]
            )
            .expect("Failed to register model_version_info"),

            detector_state: register_int_gauge!(
                "anomaly_detector_state",
                "Coordinator state: 0 unloaded, 1 ready, 2 degraded"
            )
            .expect("Failed to register detector_state"),

            inflight_predictions: register_int_gauge!(
                "anomaly_detector_inflight_predictions",
                "Number of predictions currently running"
            )
            .expect("Failed to register inflight_predictions"),
        }
    }
}

/// Detector metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance. Clones share the same
/// underlying metrics.
#[derive(Clone, Copy)]
pub struct DetectorMetrics {
    inner: &'static DetectorMetricsInner,
}

impl Default for DetectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DetectorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorMetrics").finish_non_exhaustive()
    }
}

impl DetectorMetrics {
    /// Create a new metrics handle (registers global metrics on first call)
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(DetectorMetricsInner::new),
        }
    }

    pub fn observe_prediction_latency(&self, duration_secs: f64) {
        self.inner.prediction_latency_seconds.observe(duration_secs);
    }

    pub fn observe_feature_latency(&self, duration_secs: f64) {
        self.inner.feature_latency_seconds.observe(duration_secs);
    }

    pub fn add_rows_scored(&self, rows: usize) {
        self.inner.rows_scored.inc_by(rows as u64);
    }

    pub fn inc_anomalies_detected(&self) {
        self.inner.anomalies_detected.inc();
    }

    /// Count a failed prediction under its error class
    pub fn inc_prediction_errors(&self, kind: &str) {
        self.inner
            .prediction_errors
            .with_label_values(&[kind])
            .inc();
    }

    pub fn inc_reload_attempts(&self) {
        self.inner.reload_attempts.inc();
    }

    pub fn inc_reload_failures(&self) {
        self.inner.reload_failures.inc();
    }

    /// Update model version info
    pub fn set_model_version(&self, version: &str) {
        self.inner.model_version_info.reset();
        self.inner
            .model_version_info
            .with_label_values(&[version])
            .set(1.0);
    }

    pub fn set_state(&self, code: i64) {
        self.inner.detector_state.set(code);
    }

    pub fn set_inflight(&self, count: usize) {
        self.inner.inflight_predictions.set(count as i64);
    }

    /// Render every registered metric in the Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&prometheus::gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Structured logger for detector events
///
/// Provides consistent JSON-formatted logging for lifecycle, reload and
/// anomaly events.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, model_version: Option<&str>) {
        info!(
            event = "detector_started",
            instance = %self.instance,
            detector_version = %version,
            model_version = model_version.unwrap_or("none"),
            "Anomaly detector started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "detector_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Anomaly detector shutting down"
        );
    }

    /// Log the outcome of a bundle reload
    pub fn log_reload(&self, old_version: Option<&str>, new_version: Option<&str>, error: Option<&str>) {
        match error {
            None => info!(
                event = "model_reloaded",
                instance = %self.instance,
                old_version = old_version.unwrap_or("none"),
                new_version = new_version.unwrap_or("none"),
                "Model bundle reloaded"
            ),
            Some(error) => warn!(
                event = "model_reload_failed",
                instance = %self.instance,
                old_version = old_version.unwrap_or("none"),
                error = %error,
                "Model bundle reload failed, keeping previous version"
            ),
        }
    }

    /// Log a scored request whose latest score crossed the threshold
    pub fn log_anomaly(&self, score: f64, threshold: f64, timestamp: i64, model_version: &str) {
        warn!(
            event = "anomaly_detected",
            instance = %self.instance,
            score = score,
            threshold = threshold,
            timestamp = timestamp,
            model_version = %model_version,
            "Anomaly detected"
        );
    }
}
