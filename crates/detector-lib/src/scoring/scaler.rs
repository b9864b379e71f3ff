//! Fitted feature scalers

use crate::error::{DetectorError, Result};
use serde::{Deserialize, Serialize};

/// Per-column zero-mean, unit-variance standardizer
///
/// Uses the population standard deviation. Constant columns get a scale of
/// 1.0 so they map to zero instead of dividing by zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(rows: &[Vec<f64>]) -> Result<Self> {
        let width = rows
            .first()
            .map(Vec::len)
            .ok_or_else(|| DetectorError::Data("cannot fit scaler on zero rows".to_string()))?;
        let n = rows.len() as f64;
        let mut mean = vec![0.0; width];
        for row in rows {
            check_width(row, width)?;
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v / n;
            }
        }
        let mut var = vec![0.0; width];
        for row in rows {
            for ((s, v), m) in var.iter_mut().zip(row).zip(&mean) {
                *s += (v - m).powi(2) / n;
            }
        }
        let scale = var
            .into_iter()
            .map(|v| {
                let sd = v.sqrt();
                if sd > f64::EPSILON {
                    sd
                } else {
                    1.0
                }
            })
            .collect();
        Ok(Self { mean, scale })
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    /// Shape and value check for deserialized parameters
    pub fn is_well_formed(&self) -> bool {
        self.mean.len() == self.scale.len()
            && self.mean.iter().all(|m| m.is_finite())
            && self.scale.iter().all(|s| s.is_finite() && *s > 0.0)
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        rows.iter()
            .map(|row| {
                check_width(row, self.width())?;
                Ok(row
                    .iter()
                    .zip(&self.mean)
                    .zip(&self.scale)
                    .map(|((v, m), s)| (v - m) / s)
                    .collect())
            })
            .collect()
    }
}

/// Min-max rescaler for a single column onto [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    min: f64,
    range: f64,
}

impl MinMaxScaler {
    pub fn fit(values: &[f64]) -> Result<Self> {
        if values.is_empty() {
            return Err(DetectorError::Data("cannot fit scaler on zero values".to_string()));
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = if max - min > f64::EPSILON { max - min } else { 1.0 };
        Ok(Self { min, range })
    }

    pub fn transform(&self, value: f64) -> f64 {
        (value - self.min) / self.range
    }

    pub fn inverse(&self, scaled: f64) -> f64 {
        scaled * self.range + self.min
    }
}

fn check_width(row: &[f64], width: usize) -> Result<()> {
    if row.len() != width {
        return Err(DetectorError::Prediction(format!(
            "row has {} features, scaler was fitted on {}",
            row.len(),
            width
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_scaler_zero_mean_unit_variance() {
        let rows = vec![vec![1.0, 10.0], vec![3.0, 10.0], vec![5.0, 10.0]];
        let scaler = StandardScaler::fit(&rows).unwrap();
        let scaled = scaler.transform(&rows).unwrap();
        let col0: Vec<f64> = scaled.iter().map(|r| r[0]).collect();
        let mean: f64 = col0.iter().sum::<f64>() / 3.0;
        let var: f64 = col0.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 3.0;
        assert!(mean.abs() < 1e-12);
        assert!((var - 1.0).abs() < 1e-12);
        // Constant column maps to zero
        assert!(scaled.iter().all(|r| r[1] == 0.0));
    }

    #[test]
    fn test_standard_scaler_width_mismatch() {
        let scaler = StandardScaler::fit(&[vec![1.0, 2.0]]).unwrap();
        assert!(scaler.transform(&[vec![1.0]]).is_err());
    }

    #[test]
    fn test_min_max_round_trip() {
        let scaler = MinMaxScaler::fit(&[2.0, 4.0, 6.0]).unwrap();
        assert_eq!(scaler.transform(2.0), 0.0);
        assert_eq!(scaler.transform(6.0), 1.0);
        assert!((scaler.inverse(scaler.transform(5.0)) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_fit_is_data_error() {
        assert!(matches!(StandardScaler::fit(&[]), Err(DetectorError::Data(_))));
        assert!(matches!(MinMaxScaler::fit(&[]), Err(DetectorError::Data(_))));
    }
}
