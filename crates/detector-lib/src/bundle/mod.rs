//! Immutable, versioned model bundles
//!
//! A bundle is the unit the training job writes and the serving process
//! loads: feature schema, both fitted scorers and the ensemble weights.
//! On disk it is a header line carrying a SHA256 of the payload, followed by
//! the JSON payload.

mod store;

pub use store::{ArtifactStore, FsArtifactStore, StoreConfig, LATEST_POINTER};

use crate::error::{DetectorError, Result};
use crate::features::FeatureConfig;
use crate::models::FeatureMatrix;
use crate::scoring::{EnsembleConfig, EnsembleScorer, FitReport, ScoredRows};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Magic prefix of the bundle header line
const HEADER_MAGIC: &str = "adb1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    version: String,
    created_at: DateTime<Utc>,
    feature_columns: Vec<String>,
    /// Transform settings the columns were produced with, when known
    #[serde(default)]
    feature_config: Option<FeatureConfig>,
    ensemble: EnsembleScorer,
}

impl ModelBundle {
    /// Fit a fresh ensemble on `features` and wrap it
    pub fn fit(
        version: impl Into<String>,
        features: &FeatureMatrix,
        config: &EnsembleConfig,
    ) -> Result<(Self, FitReport)> {
        let mut ensemble = config.build()?;
        let report = ensemble.fit(features)?;
        let bundle = Self {
            version: version.into(),
            created_at: Utc::now(),
            feature_columns: features.column_names(),
            feature_config: None,
            ensemble,
        };
        bundle.validate()?;
        Ok((bundle, report))
    }

    /// Record the feature transform settings used for training
    pub fn with_feature_config(mut self, config: FeatureConfig) -> Self {
        self.feature_config = Some(config);
        self
    }

    pub fn feature_config(&self) -> Option<&FeatureConfig> {
        self.feature_config.as_ref()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.feature_columns
    }

    pub fn target_column(&self) -> &str {
        self.ensemble.target_column()
    }

    pub fn ensemble(&self) -> &EnsembleScorer {
        &self.ensemble
    }

    /// Score a matrix whose columns must match the fitted schema exactly
    pub fn score(&self, features: &FeatureMatrix) -> Result<ScoredRows> {
        let actual = features.column_names();
        if actual != self.feature_columns {
            return Err(DetectorError::SchemaMismatch {
                expected: self.feature_columns.clone(),
                actual,
            });
        }
        self.ensemble.score(features)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(DetectorError::ModelLoad("bundle has no version".to_string()));
        }
        if !self
            .feature_columns
            .iter()
            .any(|c| c == self.ensemble.target_column())
        {
            return Err(DetectorError::ModelLoad(format!(
                "target column {} is not part of the feature schema",
                self.ensemble.target_column()
            )));
        }
        self.ensemble.validate(self.feature_columns.len())
    }

    /// Serialize to the on-disk format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(self)
            .map_err(|e| DetectorError::Storage(format!("failed to encode bundle: {}", e)))?;
        let mut out = format!("{} {}\n", HEADER_MAGIC, compute_checksum(&payload)).into_bytes();
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parse and verify the on-disk format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let newline = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| DetectorError::ModelLoad("bundle header is missing".to_string()))?;
        let header = std::str::from_utf8(&bytes[..newline])
            .map_err(|_| DetectorError::ModelLoad("bundle header is not utf-8".to_string()))?;
        let expected = match header.split_once(' ') {
            Some((HEADER_MAGIC, checksum)) => checksum.trim(),
            _ => {
                return Err(DetectorError::ModelLoad(format!(
                    "unrecognised bundle header {:?}",
                    header
                )))
            }
        };

        let payload = &bytes[newline + 1..];
        let actual = compute_checksum(payload);
        if actual != expected {
            return Err(DetectorError::ModelLoad(format!(
                "checksum mismatch: expected {}, got {}",
                expected, actual
            )));
        }

        let bundle: ModelBundle = serde_json::from_slice(payload)
            .map_err(|e| DetectorError::ModelLoad(format!("failed to decode bundle: {}", e)))?;
        bundle.validate()?;
        Ok(bundle)
    }
}

/// Compute SHA256 checksum of data
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::Column;
    use crate::scoring::{PointScorerConfig, SequenceScorerConfig, TrainingParams};

    pub fn sample_features(rows: usize, phase: f64) -> FeatureMatrix {
        let cpu: Vec<f64> = (0..rows)
            .map(|i| 40.0 + 5.0 * (i as f64 * 0.2 + phase).sin())
            .collect();
        let mem: Vec<f64> = (0..rows).map(|i| 60.0 + (i % 5) as f64).collect();
        FeatureMatrix::new(
            (0..rows as i64).map(|i| 1_700_000_000 + i * 60).collect(),
            vec![Column::dense("cpu_raw", cpu), Column::dense("mem_raw", mem)],
        )
        .unwrap()
    }

    pub fn small_config() -> EnsembleConfig {
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
                random_state: 3,
            },
            ..Default::default()
        }
    }

    pub fn fitted_bundle(version: &str) -> ModelBundle {
        fitted_bundle_on(version, 0.0)
    }

    /// A bundle fitted on a phase-shifted wave, so its scores differ
    pub fn fitted_bundle_on(version: &str, phase: f64) -> ModelBundle {
        ModelBundle::fit(version, &sample_features(48, phase), &small_config())
            .unwrap()
            .0
    }
}
