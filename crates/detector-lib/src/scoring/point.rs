//! Point anomaly scorer: standardizer + isolation forest

use super::isolation_forest::IsolationForest;
use super::scaler::StandardScaler;
use crate::error::{DetectorError, Result};
use crate::models::FeatureMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointScorerConfig {
    /// Expected fraction of anomalous rows
    pub contamination: f64,
    pub num_trees: usize,
    pub max_samples: usize,
    pub random_state: u64,
}

impl Default for PointScorerConfig {
    fn default() -> Self {
        Self {
            contamination: 0.01,
            num_trees: 300,
            max_samples: 256,
            random_state: 42,
        }
    }
}

/// Density-based per-row anomaly scorer
///
/// Scores are `2^(-E[h(x)] / c(n))`: non-negative, higher is more
/// anomalous. The contamination quantile of the training scores is kept as
/// [`threshold`](Self::threshold).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointAnomalyScorer {
    config: PointScorerConfig,
    scaler: Option<StandardScaler>,
    forest: Option<IsolationForest>,
}

impl PointAnomalyScorer {
    pub fn new(config: PointScorerConfig) -> Self {
        Self {
            config,
            scaler: None,
            forest: None,
        }
    }

    pub fn fit(&mut self, features: &FeatureMatrix) -> Result<()> {
        if !(0.0..=0.5).contains(&self.config.contamination) {
            return Err(DetectorError::Data(format!(
                "contamination must be in [0, 0.5], got {}",
                self.config.contamination
            )));
        }
        let rows = features.to_dense()?;
        let scaler = StandardScaler::fit(&rows)?;
        let scaled = scaler.transform(&rows)?;
        let forest = IsolationForest::fit(
            &scaled,
            self.config.num_trees,
            self.config.max_samples,
            self.config.contamination,
            self.config.random_state,
        );
        debug!(
            rows = rows.len(),
            trees = forest.num_trees(),
            threshold = forest.threshold(),
            "Point scorer fitted"
        );
        self.scaler = Some(scaler);
        self.forest = Some(forest);
        Ok(())
    }

    pub fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>> {
        let (scaler, forest) = self.fitted()?;
        let rows = features.to_dense()?;
        let scaled = scaler.transform(&rows)?;
        Ok(scaled.iter().map(|row| forest.score(row)).collect())
    }

    /// Training-score quantile matching the configured contamination
    pub fn threshold(&self) -> Option<f64> {
        self.forest.as_ref().map(IsolationForest::threshold)
    }

    pub fn is_fitted(&self) -> bool {
        self.scaler.is_some() && self.forest.is_some()
    }

    /// Both halves must be present and sized for `width` feature columns
    pub fn validate(&self, width: usize) -> Result<()> {
        match (&self.scaler, &self.forest) {
            (Some(scaler), Some(forest)) => {
                if !scaler.is_well_formed() || scaler.width() != width {
                    return Err(DetectorError::ModelLoad(format!(
                        "point scaler covers {} features, schema has {}",
                        scaler.width(),
                        width
                    )));
                }
                if !forest.is_well_formed(width) {
                    return Err(DetectorError::ModelLoad(format!(
                        "isolation forest does not fit a {}-feature schema",
                        width
                    )));
                }
                Ok(())
            }
            (None, None) => Err(DetectorError::ModelLoad("point scorer is not fitted".to_string())),
            _ => Err(DetectorError::ModelLoad(
                "point scorer is missing its scaler or its tree ensemble".to_string(),
            )),
        }
    }

    fn fitted(&self) -> Result<(&StandardScaler, &IsolationForest)> {
        match (&self.scaler, &self.forest) {
            (Some(s), Some(f)) => Ok((s, f)),
            _ => Err(DetectorError::Prediction("point scorer is not fitted".to_string())),
        }
    }
}

impl Default for PointAnomalyScorer {
    fn default() -> Self {
        Self::new(PointScorerConfig::default())
    }
}
