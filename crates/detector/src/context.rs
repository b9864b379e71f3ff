//! Shared objects handed to every request handler

use crate::config::DetectorConfig;
use anyhow::{Context, Result};
use detector_lib::{
    alerting::AlertGenerator,
    bundle::{FsArtifactStore, StoreConfig},
    features::{select_transformer, FeatureConfig, FeatureTransformer},
    health::{components, HealthRegistry},
    observability::{DetectorMetrics, StructuredLogger},
    reload::{DetectorInfo, HotReloadCoordinator},
    source::{MetricSource, PrometheusSource},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Score cut-offs applied at the HTTP boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub warning: f64,
    pub critical: f64,
}

/// Everything the handlers need, built once at startup
pub struct AppContext {
    pub coordinator: Arc<HotReloadCoordinator>,
    pub transformer: Arc<dyn FeatureTransformer>,
    /// Settings the primary transformer was built with
    pub features: FeatureConfig,
    pub source: Arc<dyn MetricSource>,
    pub alerts: AlertGenerator,
    pub metrics: DetectorMetrics,
    pub health: HealthRegistry,
    pub logger: StructuredLogger,
    pub thresholds: Thresholds,
}

impl AppContext {
    pub async fn from_config(config: &DetectorConfig) -> Result<Self> {
        let health = HealthRegistry::new();
        health.register(components::MODEL).await;
        health.register(components::METRIC_SOURCE).await;

        let metrics = DetectorMetrics::new();

        let store = FsArtifactStore::new(StoreConfig {
            root: config.model_dir.clone(),
            versions_to_keep: config.bundle_versions_to_keep,
        })
        .context("Failed to open artifact store")?;
        let coordinator = HotReloadCoordinator::new(Arc::new(store))
            .with_metrics(metrics)
            .with_health(health.clone());

        let timeout = Duration::from_secs(config.prometheus_timeout_secs);
        let source = PrometheusSource::new(&config.prometheus_url, timeout)
            .context("Failed to configure Prometheus source")?;

        let mut alerts = AlertGenerator::new(config.threshold_critical);
        if let Some(url) = &config.alertmanager_url {
            health.register(components::ALERT_SINK).await;
            alerts = alerts
                .with_sink(url, timeout)
                .context("Failed to configure Alertmanager sink")?;
        }

        Ok(Self {
            coordinator: Arc::new(coordinator),
            transformer: Arc::from(select_transformer(
                config.feature_engine,
                config.features.clone(),
            )),
            features: config.features.clone(),
            source: Arc::new(source),
            alerts,
            metrics,
            health,
            logger: StructuredLogger::new(&config.instance),
            thresholds: Thresholds {
                warning: config.threshold_warning,
                critical: config.threshold_critical,
            },
        })
    }

    /// Log every way the serving transform diverges from the loaded bundle
    pub fn warn_on_feature_mismatch(&self) {
        let info = self.coordinator.info();
        for problem in feature_mismatches(self.transformer.name(), &self.features, &info) {
            warn!(
                version = info.version.as_deref().unwrap_or("none"),
                transformer = self.transformer.name(),
                "{}",
                problem
            );
        }
    }
}

/// Reasons `transformer` cannot reproduce the features the bundle in `info`
/// was trained on
pub fn feature_mismatches(
    transformer: &str,
    serving: &FeatureConfig,
    info: &DetectorInfo,
) -> Vec<String> {
    let mut problems = Vec::new();
    if info.version.is_none() {
        return problems;
    }

    if transformer == "builtin" {
        if info.feature_config.is_some() {
            problems.push(
                "bundle was trained on windowed features; builtin summary columns will not match"
                    .to_string(),
            );
        }
        if let Some(lookback) = info.lookback.filter(|l| *l > 0) {
            problems.push(format!(
                "builtin transform yields one row per request, bundle needs more than {} to score",
                lookback
            ));
        }
    } else if let Some(trained) = info.feature_config.as_ref().filter(|c| *c != serving) {
        problems.push(format!(
            "bundle was trained with rolling window {}s and lags {:?}, serving uses {}s and {:?}",
            trained.rolling_window_secs, trained.lags, serving.rolling_window_secs, serving.lags
        ));
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use detector_lib::reload::ServingState;

    fn info(feature_config: Option<FeatureConfig>, lookback: usize) -> DetectorInfo {
        DetectorInfo {
            state: ServingState::Ready,
            version: Some("v1".to_string()),
            created_at: None,
            loaded_at: None,
            degraded: false,
            last_error: None,
            feature_columns: vec!["cpu_raw".to_string()],
            feature_config,
            lookback: Some(lookback),
        }
    }

    #[test]
    fn test_matching_primary_config_is_clean() {
        let config = FeatureConfig::default();
        assert!(feature_mismatches("primary", &config, &info(Some(config.clone()), 60)).is_empty());
        // Bundles written without a recorded config cannot be checked
        assert!(feature_mismatches("primary", &config, &info(None, 60)).is_empty());
    }

    #[test]
    fn test_rolling_window_drift_reported() {
        let trained = FeatureConfig::default();
        let serving = FeatureConfig {
            rolling_window_secs: 900,
            ..FeatureConfig::default()
        };
        let problems = feature_mismatches("primary", &serving, &info(Some(trained), 60));
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("900s"));
    }

    #[test]
    fn test_builtin_against_windowed_bundle_reported() {
        let config = FeatureConfig::default();
        let problems = feature_mismatches("builtin", &config, &info(Some(config.clone()), 60));
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn test_unloaded_has_nothing_to_compare() {
        let mut unloaded = info(None, 0);
        unloaded.version = None;
        assert!(feature_mismatches("builtin", &FeatureConfig::default(), &unloaded).is_empty());
    }
}
