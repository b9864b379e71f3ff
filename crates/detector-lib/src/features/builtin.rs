//! Summary-statistic fallback transform
//!
//! Collapses each metric into one row of descriptive statistics taken over
//! the whole request window.

use super::{FeatureTransformer, RawMetrics};
use crate::error::{DetectorError, Result};
use crate::models::{Column, FeatureMatrix};

pub struct BuiltinTransformer;

const STATS: [&str; 9] = [
    "mean", "std", "min", "max", "median", "current", "rate", "p95", "p99",
];

impl FeatureTransformer for BuiltinTransformer {
    fn transform(&self, raw: &RawMetrics) -> Result<FeatureMatrix> {
        let mut columns = Vec::new();
        let mut latest: Option<i64> = None;

        for (metric, series) in raw {
            if metric.trim().is_empty() {
                return Err(DetectorError::Data("metric name must not be empty".to_string()));
            }
            let values: Vec<f64> = series.values().into_iter().flatten().collect();
            if values.is_empty() {
                continue;
            }
            if let Some(last) = series.samples().last() {
                latest = Some(latest.map_or(last.timestamp, |t| t.max(last.timestamp)));
            }

            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            let current = values[values.len() - 1];
            let rate = if values.len() > 1 {
                current - values[values.len() - 2]
            } else {
                0.0
            };
            let stats = [
                mean,
                std,
                values.iter().copied().fold(f64::INFINITY, f64::min),
                values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                percentile(&values, 50.0),
                current,
                rate,
                percentile(&values, 95.0),
                percentile(&values, 99.0),
            ];
            for (stat, value) in STATS.iter().zip(stats) {
                columns.push(Column::dense(format!("{}_{}", metric, stat), vec![value]));
            }
        }

        match latest {
            Some(ts) => FeatureMatrix::new(vec![ts], columns),
            None => Ok(FeatureMatrix::empty()),
        }
    }

    fn name(&self) -> &'static str {
        "builtin"
    }
}

/// Percentile with linear interpolation between closest ranks
fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}
