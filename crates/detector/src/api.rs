//! HTTP API: scoring, model management, health checks and Prometheus metrics

use crate::context::AppContext;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use detector_lib::{
    error::DetectorError,
    features::RawMetrics,
    health::{components, ComponentStatus, ReadinessResponse},
    models::{MetricSeries, Sample},
    reload::Prediction,
    source::QueryWindow,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

pub type SharedContext = Arc<AppContext>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    /// Raw samples keyed by metric name
    pub metrics: BTreeMap<String, Vec<Sample>>,
    /// Overrides the configured warning threshold
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Attached to any alert this request raises
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub timestamp: i64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub model_version: String,
    /// Normalized score of the most recent scored row
    pub anomaly_score: Option<f64>,
    pub is_anomaly: bool,
    pub threshold: f64,
    /// Timestamp of the row `anomaly_score` belongs to
    pub timestamp: Option<i64>,
    /// Raw ensemble scores of every scored row
    pub scores: Vec<ScoredPoint>,
    pub feature_engine: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
    pub retryable: bool,
}

/// A [`DetectorError`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub DetectorError);

impl From<DetectorError> for ApiError {
    fn from(err: DetectorError) -> Self {
        Self(err)
    }
}

/// Status code for each error class
pub fn status_for(err: &DetectorError) -> StatusCode {
    match err {
        DetectorError::Data(_) | DetectorError::SchemaMismatch { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        DetectorError::ModelNotLoaded | DetectorError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        DetectorError::Source(_) => StatusCode::BAD_GATEWAY,
        DetectorError::ModelLoad(_) | DetectorError::Prediction(_) | DetectorError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
            retryable: self.0.is_retryable(),
        };
        (status_for(&self.0), Json(body)).into_response()
    }
}

/// Map a raw ensemble score into [0, 1]
pub fn normalize_score(score: f64) -> f64 {
    if score > 1.0 {
        (score / 100.0).min(1.0)
    } else {
        score
    }
}

/// Liveness: 200 unless a component is unhealthy
async fn healthz(State(ctx): State<SharedContext>) -> impl IntoResponse {
    let health = ctx.health.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness: 200 iff a bundle is loaded and shutdown has not begun
async fn readyz(State(ctx): State<SharedContext>) -> impl IntoResponse {
    let reason = if ctx.coordinator.is_shutting_down() {
        Some("Shutting down")
    } else if !ctx.coordinator.health() {
        Some("No model bundle loaded")
    } else {
        None
    };
    let readiness = ReadinessResponse {
        ready: reason.is_none(),
        reason: reason.map(str::to_string),
    };

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics(State(ctx): State<SharedContext>) -> Response {
    match ctx.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn predict(
    State(ctx): State<SharedContext>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, ApiError> {
    let raw: RawMetrics = request
        .metrics
        .into_iter()
        .map(|(name, samples)| {
            let series = MetricSeries::new(name.clone(), samples);
            (name, series)
        })
        .collect();
    score_raw(ctx, raw, request.threshold, request.labels)
        .await
        .map(Json)
}

async fn info(State(ctx): State<SharedContext>) -> impl IntoResponse {
    Json(ctx.coordinator.info())
}

async fn reload(State(ctx): State<SharedContext>) -> Response {
    let before = ctx.coordinator.info().version;
    match ctx.coordinator.reload().await {
        Ok(info) => {
            ctx.logger
                .log_reload(before.as_deref(), info.version.as_deref(), None);
            ctx.warn_on_feature_mismatch();
            (StatusCode::OK, Json(info)).into_response()
        }
        Err(e) => {
            ctx.logger
                .log_reload(before.as_deref(), None, Some(&e.to_string()));
            ApiError(e).into_response()
        }
    }
}

/// Pull the default metric set from the source and score it
async fn score_default_metrics(
    State(ctx): State<SharedContext>,
) -> Result<Json<PredictResponse>, ApiError> {
    let raw = match ctx.source.default_metrics(QueryWindow::default()).await {
        Ok(raw) => {
            ctx.health.set_healthy(components::METRIC_SOURCE).await;
            raw
        }
        Err(e) => {
            ctx.health
                .set_degraded(components::METRIC_SOURCE, e.to_string())
                .await;
            ctx.metrics.inc_prediction_errors(e.kind());
            return Err(e.into());
        }
    };
    score_raw(ctx, raw, None, HashMap::new()).await.map(Json)
}

/// Transform, score and post-process one request
async fn score_raw(
    ctx: SharedContext,
    raw: RawMetrics,
    threshold: Option<f64>,
    labels: HashMap<String, String>,
) -> Result<PredictResponse, ApiError> {
    let worker = Arc::clone(&ctx);
    let scored = tokio::task::spawn_blocking(move || run_pipeline(&worker, &raw))
        .await
        .map_err(|e| DetectorError::Prediction(format!("scoring task failed: {}", e)))
        .and_then(|r| r);

    let prediction = match scored {
        Ok(p) => p,
        Err(e) => {
            debug!(error = %e, kind = e.kind(), "Prediction failed");
            ctx.metrics.inc_prediction_errors(e.kind());
            return Err(e.into());
        }
    };
    ctx.metrics.add_rows_scored(prediction.scores.len());

    let threshold = threshold.unwrap_or(ctx.thresholds.warning);
    let latest = prediction
        .timestamps
        .last()
        .copied()
        .zip(prediction.scores.last().copied());
    let anomaly_score = latest.map(|(_, score)| normalize_score(score));
    let is_anomaly = anomaly_score.map_or(false, |s| s > threshold);

    if let (Some((timestamp, _)), Some(score)) = (latest, anomaly_score) {
        if is_anomaly {
            ctx.metrics.inc_anomalies_detected();
            ctx.logger
                .log_anomaly(score, threshold, timestamp, &prediction.model_version);
        }
        if score > ctx.thresholds.critical {
            let alerts = ctx.alerts.alerts_for(&[score], &labels);
            ctx.alerts.send(alerts);
        }
    }

    Ok(PredictResponse {
        model_version: prediction.model_version,
        anomaly_score,
        is_anomaly,
        threshold,
        timestamp: latest.map(|(ts, _)| ts),
        scores: prediction
            .timestamps
            .into_iter()
            .zip(prediction.scores)
            .map(|(timestamp, score)| ScoredPoint { timestamp, score })
            .collect(),
        feature_engine: ctx.transformer.name().to_string(),
    })
}

fn run_pipeline(ctx: &AppContext, raw: &RawMetrics) -> Result<Prediction, DetectorError> {
    let started = Instant::now();
    let mut features = ctx.transformer.transform(raw)?;
    features.fill_gaps();
    ctx.metrics
        .observe_feature_latency(started.elapsed().as_secs_f64());
    if features.is_empty() {
        return Err(DetectorError::Data("request contains no samples".to_string()));
    }

    let started = Instant::now();
    let prediction = ctx.coordinator.predict(&features)?;
    ctx.metrics
        .observe_prediction_latency(started.elapsed().as_secs_f64());
    Ok(prediction)
}

/// Create the API router
pub fn create_router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/predict", post(predict))
        .route("/api/v1/info", get(info))
        .route("/api/v1/reload", post(reload))
        .route("/api/v1/metrics/default", get(score_default_metrics))
        .with_state(ctx)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    port: u16,
    ctx: SharedContext,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(ctx);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_score() {
        assert_eq!(normalize_score(0.4), 0.4);
        assert_eq!(normalize_score(1.0), 1.0);
        assert!((normalize_score(42.0) - 0.42).abs() < 1e-12);
        assert_eq!(normalize_score(250.0), 1.0);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&DetectorError::ModelNotLoaded),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&DetectorError::SchemaMismatch {
                expected: vec![],
                actual: vec![]
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&DetectorError::Source("down".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&DetectorError::ModelLoad("corrupt".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
