//! Weighted combination of the point and sequence-residual scores
//!
//! Rows without a residual (the first `lookback` rows of the input) are
//! excluded from the output, so a call on `n` rows always returns
//! `n.saturating_sub(lookback)` scores aligned to rows `lookback..n`.

use super::point::PointAnomalyScorer;
use super::sequence::SequenceResidualScorer;
use crate::error::{DetectorError, Result};
use crate::models::FeatureMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Allowed deviation of the weight sum from 1.0
const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleWeights {
    pub point: f64,
    pub residual: f64,
}

impl EnsembleWeights {
    pub fn new(point: f64, residual: f64) -> Result<Self> {
        let weights = Self { point, residual };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> Result<()> {
        let valid = self.point >= 0.0
            && self.residual >= 0.0
            && (self.point + self.residual - 1.0).abs() <= WEIGHT_TOLERANCE;
        if valid {
            Ok(())
        } else {
            Err(DetectorError::Data(format!(
                "ensemble weights must be non-negative and sum to 1.0, got {} + {}",
                self.point, self.residual
            )))
        }
    }
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self {
            point: 0.6,
            residual: 0.4,
        }
    }
}

/// Per-row ensemble output with the row timestamps it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRows {
    pub timestamps: Vec<i64>,
    pub scores: Vec<f64>,
}

/// Summary of a fit, for logs and the training report
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FitReport {
    pub rows: usize,
    pub sequence_mse: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleScorer {
    point: PointAnomalyScorer,
    sequence: SequenceResidualScorer,
    weights: EnsembleWeights,
    target_column: String,
}

impl EnsembleScorer {
    pub fn new(
        point: PointAnomalyScorer,
        sequence: SequenceResidualScorer,
        weights: EnsembleWeights,
        target_column: impl Into<String>,
    ) -> Result<Self> {
        weights.validate()?;
        Ok(Self {
            point,
            sequence,
            weights,
            target_column: target_column.into(),
        })
    }

    pub fn weights(&self) -> EnsembleWeights {
        self.weights
    }

    pub fn target_column(&self) -> &str {
        &self.target_column
    }

    pub fn lookback(&self) -> usize {
        self.sequence.lookback()
    }

    pub fn point(&self) -> &PointAnomalyScorer {
        &self.point
    }

    pub fn sequence(&self) -> &SequenceResidualScorer {
        &self.sequence
    }

    /// Fit the point scorer, then the sequence scorer, on the same matrix
    pub fn fit(&mut self, features: &FeatureMatrix) -> Result<FitReport> {
        self.point.fit(features)?;
        let sequence_mse = self.sequence.fit(features, &self.target_column)?;
        Ok(FitReport {
            rows: features.rows(),
            sequence_mse,
        })
    }

    pub fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>> {
        let point = self.point.predict(features)?;
        let residual = self.sequence.residual(features, &self.target_column)?;

        let expected = features.rows().saturating_sub(self.lookback());
        if point.len() != features.rows() || residual.len() != expected {
            return Err(DetectorError::Prediction(format!(
                "scorer outputs misaligned: {} point, {} residual for {} rows",
                point.len(),
                residual.len(),
                features.rows()
            )));
        }

        let offset = features.rows() - residual.len();
        let scores: Vec<f64> = point[offset..]
            .iter()
            .zip(&residual)
            .map(|(p, r)| self.weights.point * p + self.weights.residual * r)
            .collect();
        debug!(rows = features.rows(), scored = scores.len(), "Ensemble scored");
        Ok(scores)
    }

    /// Scores paired with the timestamps of the rows they belong to
    pub fn score(&self, features: &FeatureMatrix) -> Result<ScoredRows> {
        let scores = self.predict(features)?;
        let offset = features.rows() - scores.len();
        Ok(ScoredRows {
            timestamps: features.timestamps()[offset..].to_vec(),
            scores,
        })
    }

    /// Check the fitted parts against a `width`-column feature schema
    pub fn validate(&self, width: usize) -> Result<()> {
        self.weights
            .validate()
            .map_err(|e| DetectorError::ModelLoad(e.to_string()))?;
        self.point.validate(width)?;
        self.sequence.validate()
    }
}
