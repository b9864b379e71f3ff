//! Feature extraction from raw metric series
//!
//! Two transformers implement [`FeatureTransformer`]: the windowed
//! [`FeatureEngineer`] and the summary-statistic [`BuiltinTransformer`].
//! One of them is selected at startup and used for the process lifetime.

mod builtin;
mod engineer;

pub use builtin::BuiltinTransformer;
pub use engineer::{
    fft_energy, lag_features, roll_stats, FeatureEngineer, RollingStats, MIN_SPECTRAL_SAMPLES,
    SPECTRAL_COLUMNS,
};

use crate::error::Result;
use crate::models::{FeatureMatrix, MetricSeries};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Raw input keyed by metric name, iterated in name order
pub type RawMetrics = BTreeMap<String, MetricSeries>;

/// Default trailing window for rolling statistics (5 minutes)
pub const DEFAULT_ROLLING_WINDOW_SECS: u64 = 5 * 60;

/// Default lag offsets in samples (one sample per minute)
pub const DEFAULT_LAGS: [usize; 4] = [1, 2, 5, 10];

/// Configuration shared by training-time and serving-time transforms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default = "default_rolling_window_secs")]
    pub rolling_window_secs: u64,
    #[serde(default = "default_lags")]
    pub lags: Vec<usize>,
}

fn default_rolling_window_secs() -> u64 {
    DEFAULT_ROLLING_WINDOW_SECS
}

fn default_lags() -> Vec<usize> {
    DEFAULT_LAGS.to_vec()
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            rolling_window_secs: DEFAULT_ROLLING_WINDOW_SECS,
            lags: DEFAULT_LAGS.to_vec(),
        }
    }
}

/// Stateless raw-metrics → feature-matrix transform
pub trait FeatureTransformer: Send + Sync {
    /// Build the feature matrix; empty input yields an empty matrix
    fn transform(&self, raw: &RawMetrics) -> Result<FeatureMatrix>;

    /// Short identifier for logs and metrics
    fn name(&self) -> &'static str;
}

/// Which transformer variant to run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureEngine {
    #[default]
    Primary,
    Builtin,
}

/// Pick the transformer once, at construction time
pub fn select_transformer(engine: FeatureEngine, config: FeatureConfig) -> Box<dyn FeatureTransformer> {
    let transformer: Box<dyn FeatureTransformer> = match engine {
        FeatureEngine::Primary => Box::new(FeatureEngineer::new(config)),
        FeatureEngine::Builtin => {
            warn!("Using built-in summary feature transform");
            Box::new(BuiltinTransformer)
        }
    };
    info!(transformer = transformer.name(), "Feature transformer selected");
    transformer
}

/// Check that a matrix is usable for scoring
pub fn validate_features(features: &FeatureMatrix) -> bool {
    if features.is_empty() {
        warn!("Feature matrix is empty");
        return false;
    }
    if features.has_gaps() {
        warn!("Feature matrix contains missing values");
        return false;
    }
    let finite = features
        .columns()
        .iter()
        .flat_map(|c| c.values.iter().flatten())
        .all(|v| v.is_finite());
    if !finite {
        warn!("Feature matrix contains non-finite values");
    }
    finite
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, Sample};

    #[test]
    fn test_select_transformer() {
        assert_eq!(
            select_transformer(FeatureEngine::Primary, FeatureConfig::default()).name(),
            "primary"
        );
        assert_eq!(
            select_transformer(FeatureEngine::Builtin, FeatureConfig::default()).name(),
            "builtin"
        );
    }

    #[test]
    fn test_feature_engine_serde() {
        let engine: FeatureEngine = serde_json::from_str("\"builtin\"").unwrap();
        assert_eq!(engine, FeatureEngine::Builtin);
    }

    #[test]
    fn test_validate_features() {
        assert!(!validate_features(&FeatureMatrix::empty()));

        let gappy = FeatureMatrix::new(vec![0], vec![Column::new("a", vec![None])]).unwrap();
        assert!(!validate_features(&gappy));

        let ok = FeatureMatrix::new(vec![0], vec![Column::dense("a", vec![1.0])]).unwrap();
        assert!(validate_features(&ok));
    }

    #[test]
    fn test_lag_scenario_twenty_rows() {
        let series = MetricSeries::new(
            "cpu",
            (0..20).map(|i| Sample::new(i * 60, i as f64)).collect(),
        );
        let lags = lag_features(&series.values(), &DEFAULT_LAGS);
        assert_eq!(lags.len(), 4);
        assert!(lags.iter().all(|(_, v)| v.len() == 20 && v.iter().all(Option::is_some)));
    }
}
