//! Integration tests for the detector API endpoints

use anomaly_detector::{
    api::create_router,
    context::{AppContext, Thresholds},
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use detector_lib::{
    alerting::AlertGenerator,
    bundle::{ArtifactStore, FsArtifactStore, StoreConfig, LATEST_POINTER},
    features::{FeatureConfig, FeatureEngineer, RawMetrics},
    health::{components, HealthRegistry},
    models::{MetricSeries, Sample},
    observability::{DetectorMetrics, StructuredLogger},
    reload::HotReloadCoordinator,
    scoring::{EnsembleConfig, PointScorerConfig, SequenceScorerConfig, TrainingParams},
    source::PrometheusSource,
    training::{Trainer, TrainingConfig},
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const START: i64 = 1_700_000_000;

fn wave(rows: usize, offset: f64) -> Vec<Sample> {
    (0..rows)
        .map(|i| {
            let t = i as f64;
            Sample::new(START + i as i64 * 60, 40.0 + offset + 5.0 * (t * 0.2).sin())
        })
        .collect()
}

fn training_metrics(rows: usize) -> RawMetrics {
    let mut raw = RawMetrics::new();
    raw.insert("cpu".to_string(), MetricSeries::new("cpu", wave(rows, 0.0)));
    raw.insert("memory".to_string(), MetricSeries::new("memory", wave(rows, 20.0)));
    raw
}

fn small_ensemble() -> EnsembleConfig {
    EnsembleConfig {
        point: PointScorerConfig {
            num_trees: 10,
            max_samples: 32,
            ..Default::default()
        },
        sequence: SequenceScorerConfig {
            lookback: 8,
            horizon: 1,
            units: 4,
            training: TrainingParams {
                epochs: 2,
                batch_size: 16,
                learning_rate: 0.01,
            },
            random_state: 7,
        },
        ..Default::default()
    }
}

async fn save_trained_bundle(store: &FsArtifactStore, version: &str) {
    let trainer = Trainer::new(TrainingConfig {
        ensemble: small_ensemble(),
        version: Some(version.to_string()),
        ..Default::default()
    });
    let (bundle, _) = trainer.fit(&training_metrics(60)).unwrap();
    store.save(&bundle).await.unwrap();
}

struct TestApp {
    router: Router,
    ctx: Arc<AppContext>,
    store: Arc<FsArtifactStore>,
    dir: TempDir,
}

async fn setup_test_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        FsArtifactStore::new(StoreConfig {
            root: dir.path().to_path_buf(),
            versions_to_keep: 3,
        })
        .unwrap(),
    );

    let health = HealthRegistry::new();
    health.register(components::MODEL).await;
    health.register(components::METRIC_SOURCE).await;
    let metrics = DetectorMetrics::new();

    let coordinator = HotReloadCoordinator::new(store.clone())
        .with_metrics(metrics)
        .with_health(health.clone());

    // Nothing listens on the discard port, so every query fails fast
    let source = PrometheusSource::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();

    let ctx = Arc::new(AppContext {
        coordinator: Arc::new(coordinator),
        transformer: Arc::new(FeatureEngineer::new(FeatureConfig::default())),
        features: FeatureConfig::default(),
        source: Arc::new(source),
        alerts: AlertGenerator::new(0.95),
        metrics,
        health,
        logger: StructuredLogger::new("api-test"),
        thresholds: Thresholds {
            warning: 0.7,
            critical: 0.95,
        },
    });

    TestApp {
        router: create_router(ctx.clone()),
        ctx,
        store,
        dir,
    }
}

async fn setup_loaded_app() -> TestApp {
    let app = setup_test_app().await;
    save_trained_bundle(&app.store, "v1").await;
    app.ctx.coordinator.load().await.unwrap();
    app
}

fn predict_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/predict")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn predict_body(rows: usize) -> Value {
    json!({
        "metrics": {
            "cpu": wave(rows, 0.0),
            "memory": wave(rows, 20.0),
        },
        "labels": { "cluster": "test" },
    })
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_predict_returns_503_when_unloaded() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(predict_request(predict_body(30)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["kind"], "model_not_loaded");
    assert_eq!(body["retryable"], true);
}

#[tokio::test]
async fn test_readyz_tracks_model_state() {
    let app = setup_test_app().await;

    let response = app.router.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let readiness = json_body(response).await;
    assert_eq!(readiness["ready"], false);
    assert_eq!(readiness["reason"], "No model bundle loaded");

    save_trained_bundle(&app.store, "v1").await;
    app.ctx.coordinator.load().await.unwrap();

    let response = app.router.oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["ready"], true);
}

#[tokio::test]
async fn test_predict_scores_latest_row() {
    let app = setup_loaded_app().await;

    let response = app
        .router
        .oneshot(predict_request(predict_body(30)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["model_version"], "v1");
    assert_eq!(body["feature_engine"], "primary");
    assert_eq!(body["threshold"], 0.7);

    // lookback 8 leaves 22 scored rows
    let scores = body["scores"].as_array().unwrap();
    assert_eq!(scores.len(), 22);
    assert_eq!(body["timestamp"], START + 29 * 60);

    let score = body["anomaly_score"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&score));
    assert_eq!(body["is_anomaly"], score > 0.7);
}

#[tokio::test]
async fn test_predict_short_request_has_no_score() {
    let app = setup_loaded_app().await;

    let response = app
        .router
        .oneshot(predict_request(predict_body(5)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["scores"].as_array().unwrap().is_empty());
    assert!(body["anomaly_score"].is_null());
    assert_eq!(body["is_anomaly"], false);
}

#[tokio::test]
async fn test_predict_threshold_override() {
    let app = setup_loaded_app().await;
    let mut request = predict_body(30);
    request["threshold"] = json!(0.0);

    let response = app.router.oneshot(predict_request(request)).await.unwrap();

    let body = json_body(response).await;
    assert_eq!(body["threshold"], 0.0);
    assert_eq!(body["is_anomaly"], true);
}

#[tokio::test]
async fn test_predict_rejects_schema_drift() {
    let app = setup_loaded_app().await;

    let response = app
        .router
        .oneshot(predict_request(json!({ "metrics": { "cpu": wave(30, 0.0) } })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert_eq!(body["kind"], "schema_mismatch");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn test_predict_rejects_empty_metrics() {
    let app = setup_loaded_app().await;

    let response = app
        .router
        .oneshot(predict_request(json!({ "metrics": {} })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json_body(response).await["kind"], "data");
}

#[tokio::test]
async fn test_info_reports_loaded_bundle() {
    let app = setup_loaded_app().await;

    let response = app.router.oneshot(get("/api/v1/info")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let info = json_body(response).await;
    assert_eq!(info["version"], "v1");
    assert_eq!(info["state"], "ready");
    assert_eq!(info["degraded"], false);
    assert_eq!(info["lookback"], 8);
    assert_eq!(info["feature_config"]["rolling_window_secs"], 300);
    assert!(info["feature_columns"]
        .as_array()
        .unwrap()
        .contains(&json!("cpu_raw")));
}

#[tokio::test]
async fn test_reload_picks_up_new_version() {
    let app = setup_loaded_app().await;
    save_trained_bundle(&app.store, "v2").await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/reload")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["version"], "v2");

    let response = app
        .router
        .oneshot(predict_request(predict_body(30)))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["model_version"], "v2");
}

#[tokio::test]
async fn test_corrupt_reload_keeps_serving_previous_bundle() {
    let app = setup_loaded_app().await;
    std::fs::write(app.dir.path().join("v2.bundle"), b"adb1 deadbeef\n{").unwrap();
    std::fs::write(app.dir.path().join(LATEST_POINTER), "v2").unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/reload")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["kind"], "model_load");

    let response = app.router.clone().oneshot(get("/api/v1/info")).await.unwrap();
    let info = json_body(response).await;
    assert_eq!(info["version"], "v1");
    assert_eq!(info["state"], "degraded");
    assert_eq!(info["degraded"], true);

    let response = app
        .router
        .clone()
        .oneshot(predict_request(predict_body(30)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["model_version"], "v1");

    // Degraded still serves, so liveness stays green
    let response = app.router.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "degraded");
}

#[tokio::test]
async fn test_default_metrics_returns_502_when_source_down() {
    let app = setup_loaded_app().await;

    let response = app
        .router
        .clone()
        .oneshot(get("/api/v1/metrics/default"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(json_body(response).await["kind"], "source");

    let response = app.router.oneshot(get("/healthz")).await.unwrap();
    let health = json_body(response).await;
    assert_eq!(health["components"]["metric_source"]["status"], "degraded");
}

#[tokio::test]
async fn test_shutdown_rejects_predictions() {
    let app = setup_loaded_app().await;
    app.ctx.coordinator.shutdown().await;

    let response = app
        .router
        .clone()
        .oneshot(predict_request(predict_body(30)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["kind"], "shutting_down");

    let response = app.router.oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let app = setup_loaded_app().await;
    app.router
        .clone()
        .oneshot(predict_request(predict_body(30)))
        .await
        .unwrap();

    let response = app.router.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("anomaly_detector_prediction_latency_seconds_bucket"));
    assert!(metrics_text.contains("anomaly_detector_feature_latency_seconds_count"));
    assert!(metrics_text.contains("anomaly_detector_rows_scored_total"));
    assert!(metrics_text.contains("anomaly_detector_model_version_info"));
}
