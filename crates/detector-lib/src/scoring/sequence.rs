//! Sequence-residual scorer
//!
//! Forecasts a target column from the previous `lookback` samples and
//! scores each row by how far the actual value lands from its forecast.

use super::recurrent::{Lstm, TrainingParams};
use super::scaler::MinMaxScaler;
use crate::error::{DetectorError, Result};
use crate::models::FeatureMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceScorerConfig {
    pub lookback: usize,
    pub horizon: usize,
    pub units: usize,
    pub training: TrainingParams,
    pub random_state: u64,
}

impl Default for SequenceScorerConfig {
    fn default() -> Self {
        Self {
            lookback: 60,
            horizon: 1,
            units: 50,
            training: TrainingParams::default(),
            random_state: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceResidualScorer {
    config: SequenceScorerConfig,
    scaler: Option<MinMaxScaler>,
    network: Option<Lstm>,
}

impl SequenceResidualScorer {
    pub fn new(config: SequenceScorerConfig) -> Self {
        Self {
            config,
            scaler: None,
            network: None,
        }
    }

    pub fn lookback(&self) -> usize {
        self.config.lookback
    }

    pub fn horizon(&self) -> usize {
        self.config.horizon
    }

    /// Fit the rescaler and the network on `target` of `features`
    ///
    /// Needs at least `lookback + horizon` rows.
    pub fn fit(&mut self, features: &FeatureMatrix, target: &str) -> Result<f64> {
        let (lookback, horizon) = (self.config.lookback, self.config.horizon);
        if lookback == 0 || horizon == 0 {
            return Err(DetectorError::Data(
                "lookback and horizon must be positive".to_string(),
            ));
        }
        let series = features.dense_column(target)?;
        if series.len() < lookback + horizon {
            return Err(DetectorError::Data(format!(
                "sequence scorer needs at least {} rows, got {}",
                lookback + horizon,
                series.len()
            )));
        }

        let scaler = MinMaxScaler::fit(&series)?;
        let scaled: Vec<f64> = series.iter().map(|v| scaler.transform(*v)).collect();
        let mut inputs = Vec::with_capacity(scaled.len() - lookback - horizon + 1);
        let mut targets = Vec::with_capacity(inputs.capacity());
        for i in lookback..=scaled.len() - horizon {
            inputs.push(scaled[i - lookback..i].to_vec());
            targets.push(scaled[i..i + horizon].to_vec());
        }

        let mut network = Lstm::new(self.config.units, horizon, self.config.random_state);
        let mse = network.train(
            &inputs,
            &targets,
            &self.config.training,
            self.config.random_state,
        );
        debug!(
            target = %target,
            windows = inputs.len(),
            mse,
            "Sequence scorer fitted"
        );

        self.scaler = Some(scaler);
        self.network = Some(network);
        Ok(mse)
    }

    /// One forecast per window start, in original units
    ///
    /// Window `w` covers rows `w..w + lookback` and forecasts the following
    /// `horizon` rows, so there are `rows - lookback + 1` forecasts (none if
    /// the input is shorter than the lookback).
    pub fn predict(&self, features: &FeatureMatrix, target: &str) -> Result<Vec<Vec<f64>>> {
        let (scaler, network) = self.fitted()?;
        let series = features.dense_column(target)?;
        let lookback = self.config.lookback;
        if series.len() < lookback {
            return Ok(Vec::new());
        }
        let scaled: Vec<f64> = series.iter().map(|v| scaler.transform(*v)).collect();
        let forecasts = (lookback..=scaled.len())
            .map(|i| {
                network
                    .forward(&scaled[i - lookback..i])
                    .into_iter()
                    .map(|v| scaler.inverse(v))
                    .collect::<Vec<f64>>()
            })
            .collect::<Vec<_>>();
        if forecasts.iter().flatten().any(|v| !v.is_finite()) {
            return Err(DetectorError::Prediction(
                "sequence forecast produced a non-finite value".to_string(),
            ));
        }
        Ok(forecasts)
    }

    /// `|actual - forecast|` for rows `lookback..rows`
    ///
    /// Row `i` is compared with the first-step forecast of the window ending
    /// at `i - 1`, so the output has `rows - lookback` entries whatever the
    /// horizon.
    pub fn residual(&self, features: &FeatureMatrix, target: &str) -> Result<Vec<f64>> {
        let forecasts = self.predict(features, target)?;
        let actual = features.dense_column(target)?;
        let lookback = self.config.lookback;
        Ok(actual
            .iter()
            .skip(lookback)
            .zip(&forecasts)
            .map(|(a, f)| (a - f[0]).abs())
            .collect())
    }

    pub fn is_fitted(&self) -> bool {
        self.scaler.is_some() && self.network.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.scaler, &self.network) {
            (Some(_), Some(net))
                if net.is_well_formed() && net.horizon() == self.config.horizon =>
            {
                Ok(())
            }
            (Some(_), Some(_)) => Err(DetectorError::ModelLoad(
                "sequence network weights are malformed".to_string(),
            )),
            _ => Err(DetectorError::ModelLoad(
                "sequence scorer is missing its scaler or its network".to_string(),
            )),
        }
    }

    fn fitted(&self) -> Result<(&MinMaxScaler, &Lstm)> {
        match (&self.scaler, &self.network) {
            (Some(s), Some(n)) => Ok((s, n)),
            _ => Err(DetectorError::Prediction("sequence scorer is not fitted".to_string())),
        }
    }
}

impl Default for SequenceResidualScorer {
    fn default() -> Self {
        Self::new(SequenceScorerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Column;

    fn wave(rows: usize) -> FeatureMatrix {
        let values = (0..rows)
            .map(|i| 50.0 + 10.0 * (i as f64 * 0.25).sin())
            .collect();
        FeatureMatrix::new(
            (0..rows as i64).map(|i| i * 60).collect(),
            vec![Column::dense("cpu_raw", values)],
        )
        .unwrap()
    }

    fn small_config(lookback: usize, horizon: usize) -> SequenceScorerConfig {
        SequenceScorerConfig {
            lookback,
            horizon,
            units: 6,
            training: TrainingParams {
                epochs: 3,
                batch_size: 16,
                learning_rate: 0.01,
            },
            random_state: 7,
        }
    }

    #[test]
    fn test_residual_length() {
        let data = wave(80);
        let mut scorer = SequenceResidualScorer::new(small_config(10, 1));
        scorer.fit(&data, "cpu_raw").unwrap();

        assert_eq!(scorer.predict(&data, "cpu_raw").unwrap().len(), 80 - 10 + 1);
        let residual = scorer.residual(&data, "cpu_raw").unwrap();
        assert_eq!(residual.len(), 80 - 10);
        assert!(residual.iter().all(|r| r.is_finite() && *r >= 0.0));
    }

    #[test]
    fn test_multi_step_horizon() {
        let data = wave(60);
        let mut scorer = SequenceResidualScorer::new(small_config(8, 3));
        scorer.fit(&data, "cpu_raw").unwrap();
        let forecasts = scorer.predict(&data, "cpu_raw").unwrap();
        assert!(forecasts.iter().all(|f| f.len() == 3));
        assert_eq!(scorer.residual(&data, "cpu_raw").unwrap().len(), 60 - 8);
    }

    #[test]
    fn test_insufficient_rows() {
        let mut scorer = SequenceResidualScorer::new(small_config(10, 1));
        assert!(matches!(
            scorer.fit(&wave(10), "cpu_raw"),
            Err(DetectorError::Data(_))
        ));
    }

    #[test]
    fn test_short_input_predicts_nothing() {
        let mut scorer = SequenceResidualScorer::new(small_config(10, 1));
        scorer.fit(&wave(40), "cpu_raw").unwrap();
        assert!(scorer.residual(&wave(5), "cpu_raw").unwrap().is_empty());
        assert!(scorer.residual(&wave(10), "cpu_raw").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_target_column() {
        let mut scorer = SequenceResidualScorer::new(small_config(5, 1));
        assert!(scorer.fit(&wave(20), "mem_raw").is_err());
    }

    #[test]
    fn test_predict_before_fit() {
        let scorer = SequenceResidualScorer::new(small_config(5, 1));
        assert!(matches!(
            scorer.residual(&wave(20), "cpu_raw"),
            Err(DetectorError::Prediction(_))
        ));
    }

    #[test]
    fn test_validate() {
        let mut scorer = SequenceResidualScorer::new(small_config(5, 1));
        assert!(scorer.validate().is_err());
        scorer.fit(&wave(20), "cpu_raw").unwrap();
        assert!(scorer.validate().is_ok());
    }
}
