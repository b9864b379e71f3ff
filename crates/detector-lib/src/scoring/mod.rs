//! Anomaly scorers
//!
//! - [`PointAnomalyScorer`]: standardizer + isolation forest, one score per row
//! - [`SequenceResidualScorer`]: LSTM forecaster, one residual per forecastable row
//! - [`EnsembleScorer`]: fixed weighted sum of the two

mod ensemble;
mod isolation_forest;
mod point;
mod recurrent;
mod scaler;
mod sequence;

pub use ensemble::{EnsembleScorer, EnsembleWeights, FitReport, ScoredRows};
pub use isolation_forest::IsolationForest;
pub use point::{PointAnomalyScorer, PointScorerConfig};
pub use recurrent::{Lstm, TrainingParams};
pub use scaler::{MinMaxScaler, StandardScaler};
pub use sequence::{SequenceResidualScorer, SequenceScorerConfig};

use serde::{Deserialize, Serialize};

/// Everything needed to build an unfitted ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub point: PointScorerConfig,
    pub sequence: SequenceScorerConfig,
    pub weights: EnsembleWeights,
    pub target_column: String,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            point: PointScorerConfig::default(),
            sequence: SequenceScorerConfig::default(),
            weights: EnsembleWeights::default(),
            target_column: "cpu_raw".to_string(),
        }
    }
}

impl EnsembleConfig {
    pub fn build(&self) -> crate::error::Result<EnsembleScorer> {
        EnsembleScorer::new(
            PointAnomalyScorer::new(self.point.clone()),
            SequenceResidualScorer::new(self.sequence.clone()),
            self.weights,
            self.target_column.clone(),
        )
    }
}
