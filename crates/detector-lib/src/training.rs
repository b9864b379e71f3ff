//! Training job: pull metrics, fit an ensemble, publish a bundle

use crate::bundle::{ArtifactStore, ModelBundle};
use crate::error::DetectorError;
use crate::features::{FeatureConfig, FeatureEngineer, FeatureTransformer, RawMetrics};
use crate::scoring::EnsembleConfig;
use crate::source::{MetricSource, QueryWindow, DEFAULT_STEP, DEFAULT_WINDOW};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// How far back to pull training data
    pub window: Duration,
    pub step: Duration,
    pub features: FeatureConfig,
    pub ensemble: EnsembleConfig,
    /// Bundle version; `v<unix-ts>` when unset
    pub version: Option<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            step: DEFAULT_STEP,
            features: FeatureConfig::default(),
            ensemble: EnsembleConfig::default(),
            version: None,
        }
    }
}

/// Outcome of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub version: String,
    pub rows: usize,
    pub feature_columns: Vec<String>,
    pub sequence_mse: f64,
    pub scored_rows: usize,
    pub mean_score: f64,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Trainer {
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Pull, fit and save; the saved bundle becomes the store's latest
    pub async fn run(
        &self,
        source: &dyn MetricSource,
        store: &dyn ArtifactStore,
    ) -> Result<TrainingReport> {
        let started = Instant::now();
        let window = QueryWindow::trailing(self.config.window, self.config.step);
        info!(
            start = %window.start,
            end = %window.end,
            step_secs = window.step.as_secs(),
            "Pulling training data"
        );
        let raw = source
            .default_metrics(window)
            .await
            .context("Failed to pull training metrics")?;

        let trainer = self.clone();
        let (bundle, mut report) = tokio::task::spawn_blocking(move || trainer.fit(&raw))
            .await
            .context("Training task panicked")??;

        store
            .save(&bundle)
            .await
            .with_context(|| format!("Failed to save bundle {}", bundle.version()))?;

        report.duration_secs = started.elapsed().as_secs_f64();
        info!(
            version = %report.version,
            rows = report.rows,
            columns = report.feature_columns.len(),
            mean_score = report.mean_score,
            duration_secs = report.duration_secs,
            "Training complete"
        );
        Ok(report)
    }

    /// Transform and fit without touching the source or the store
    pub fn fit(&self, raw: &RawMetrics) -> Result<(ModelBundle, TrainingReport)> {
        let engineer = FeatureEngineer::new(self.config.features.clone());
        let mut features = engineer.transform(raw).context("Feature transform failed")?;
        features.fill_gaps();
        if features.is_empty() {
            return Err(DetectorError::Data("no training rows after feature transform".to_string()).into());
        }

        let version = self
            .config
            .version
            .clone()
            .unwrap_or_else(|| format!("v{}", chrono::Utc::now().timestamp()));
        info!(
            version = %version,
            rows = features.rows(),
            columns = features.columns().len(),
            "Fitting ensemble"
        );
        let (bundle, fit) = ModelBundle::fit(version, &features, &self.config.ensemble)
            .context("Ensemble fit failed")?;
        let bundle = bundle.with_feature_config(self.config.features.clone());

        let scored = bundle.score(&features).context("Scoring training data failed")?;
        let mean_score = if scored.scores.is_empty() {
            0.0
        } else {
            scored.scores.iter().sum::<f64>() / scored.scores.len() as f64
        };

        let report = TrainingReport {
            version: bundle.version().to_string(),
            rows: fit.rows,
            feature_columns: bundle.feature_columns().to_vec(),
            sequence_mse: fit.sequence_mse,
            scored_rows: scored.scores.len(),
            mean_score,
            duration_secs: 0.0,
        };
        Ok((bundle, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::test_support::small_config;
    use crate::bundle::{FsArtifactStore, StoreConfig};
    use crate::error::Result as DetectorResult;
    use crate::models::{MetricSeries, Sample};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Source returning a deterministic wave per metric
    struct WaveSource {
        samples: usize,
    }

    #[async_trait]
    impl MetricSource for WaveSource {
        async fn query_range(
            &self,
            name: &str,
            _query: &str,
            _window: QueryWindow,
        ) -> DetectorResult<MetricSeries> {
            let offset = name.len() as f64;
            let samples = (0..self.samples)
                .map(|i| {
                    let t = i as f64;
                    Sample::new(1_700_000_000 + i as i64 * 60, 10.0 + offset + (t * 0.3 + offset).sin())
                })
                .collect();
            Ok(MetricSeries::new(name, samples))
        }
    }

    fn config(version: &str) -> TrainingConfig {
        TrainingConfig {
            ensemble: small_config(),
            version: Some(version.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_saves_loadable_bundle() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(StoreConfig {
            root: dir.path().to_path_buf(),
            versions_to_keep: 3,
        })
        .unwrap();

        let trainer = Trainer::new(config("v-test"));
        let report = trainer
            .run(&WaveSource { samples: 60 }, &store)
            .await
            .unwrap();

        assert_eq!(report.version, "v-test");
        assert_eq!(report.rows, 60);
        assert_eq!(report.scored_rows, 60 - 8);
        assert!(report.mean_score.is_finite());
        assert!(report.feature_columns.contains(&"cpu_raw".to_string()));

        let loaded = store.load_latest().await.unwrap();
        assert_eq!(loaded.version(), "v-test");
        assert_eq!(loaded.feature_config(), Some(&trainer.config().features));
        assert_eq!(loaded.feature_columns(), report.feature_columns.as_slice());
    }

    #[tokio::test]
    async fn test_empty_source_fails() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(StoreConfig {
            root: dir.path().to_path_buf(),
            versions_to_keep: 3,
        })
        .unwrap();

        let trainer = Trainer::new(config("v-empty"));
        assert!(trainer.run(&WaveSource { samples: 0 }, &store).await.is_err());
        assert!(store.versions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_version_is_timestamped() {
        let trainer = Trainer::new(TrainingConfig {
            ensemble: small_config(),
            ..Default::default()
        });
        let raw = WaveSource { samples: 40 }
            .default_metrics(QueryWindow::default())
            .await
            .unwrap();
        let (bundle, _) = trainer.fit(&raw).unwrap();
        assert!(bundle.version().starts_with('v'));
        assert!(bundle.version()[1..].parse::<i64>().is_ok());
    }
}
