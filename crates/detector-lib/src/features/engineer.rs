//! Windowed feature engineering
//!
//! Turns per-metric raw series into one timestamp-keyed feature matrix.
//! For every metric the raw value column is renamed `<metric>_raw`, then
//! trailing rolling statistics, lagged values and a spectral-energy proxy
//! are derived from it. Per-metric tables are outer-joined on timestamp.

use super::{FeatureConfig, FeatureTransformer, RawMetrics};
use crate::error::{DetectorError, Result};
use crate::models::{backward_fill, Column, FeatureMatrix, MetricSeries};
use std::collections::{BTreeSet, HashMap};
use std::f64::consts::PI;
use tracing::debug;

/// Minimum number of observed values for the spectral proxy
pub const MIN_SPECTRAL_SAMPLES: usize = 10;

/// Number of spectral magnitude columns per metric
pub const SPECTRAL_COLUMNS: usize = 3;

/// Trailing-window statistics for one column
#[derive(Debug, Clone, PartialEq)]
pub struct RollingStats {
    pub mean: Vec<Option<f64>>,
    pub std: Vec<Option<f64>>,
    pub min: Vec<Option<f64>>,
    pub max: Vec<Option<f64>>,
}

/// Primary feature transformer
#[derive(Debug, Clone, Default)]
pub struct FeatureEngineer {
    config: FeatureConfig,
}

impl FeatureEngineer {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Build the feature table of one metric
    fn metric_table(&self, metric: &str, series: &MetricSeries) -> (Vec<i64>, Vec<Column>) {
        let timestamps = series.timestamps();
        let raw = series.values();
        let base = format!("{}_raw", metric);

        let stats = roll_stats(&timestamps, &raw, self.config.rolling_window_secs);
        let lags = lag_features(&raw, &self.config.lags);
        let spectral = fft_energy(&raw);

        let mut columns = Vec::with_capacity(5 + lags.len() + SPECTRAL_COLUMNS);
        columns.push(Column::new(base.clone(), raw));
        columns.push(Column::new(format!("{}_mean", base), stats.mean));
        columns.push(Column::new(format!("{}_std", base), stats.std));
        columns.push(Column::new(format!("{}_min", base), stats.min));
        columns.push(Column::new(format!("{}_max", base), stats.max));
        for (lag, values) in lags {
            columns.push(Column::new(format!("{}_lag_{}m", metric, lag), values));
        }
        for (i, energy) in spectral.iter().enumerate() {
            columns.push(Column::dense(
                format!("{}_fft_{}", metric, i + 1),
                vec![*energy; timestamps.len()],
            ));
        }
        (timestamps, columns)
    }
}

impl FeatureTransformer for FeatureEngineer {
    fn transform(&self, raw: &RawMetrics) -> Result<FeatureMatrix> {
        let mut tables = Vec::with_capacity(raw.len());
        for (metric, series) in raw {
            if metric.trim().is_empty() {
                return Err(DetectorError::Data("metric name must not be empty".to_string()));
            }
            if series.is_empty() {
                debug!(metric = %metric, "Skipping empty series");
                continue;
            }
            tables.push(self.metric_table(metric, series));
        }

        if tables.is_empty() {
            return Ok(FeatureMatrix::empty());
        }

        let matrix = outer_join(tables)?;
        debug!(
            rows = matrix.rows(),
            columns = matrix.columns().len(),
            metrics = raw.len(),
            "Feature matrix built"
        );
        Ok(matrix)
    }

    fn name(&self) -> &'static str {
        "primary"
    }
}

/// Full outer join of per-metric tables on timestamp, sorted ascending
fn outer_join(tables: Vec<(Vec<i64>, Vec<Column>)>) -> Result<FeatureMatrix> {
    let all: BTreeSet<i64> = tables
        .iter()
        .flat_map(|(ts, _)| ts.iter().copied())
        .collect();
    let timestamps: Vec<i64> = all.into_iter().collect();
    let row_of: HashMap<i64, usize> = timestamps
        .iter()
        .enumerate()
        .map(|(row, ts)| (*ts, row))
        .collect();

    let mut merged = Vec::new();
    for (table_ts, columns) in tables {
        for column in columns {
            let mut values = vec![None; timestamps.len()];
            for (ts, value) in table_ts.iter().zip(column.values) {
                values[row_of[ts]] = value;
            }
            merged.push(Column::new(column.name, values));
        }
    }
    FeatureMatrix::new(timestamps, merged)
}

/// Trailing time-window mean/std/min/max with a one-observation minimum
///
/// The window for row `i` covers observations with timestamp in
/// `(ts[i] - window_secs, ts[i]]`. Sample standard deviation needs two
/// observations, so leading rows are backward-filled from the first computed
/// value; a series that never has two observations in a window gets 0.0.
pub fn roll_stats(timestamps: &[i64], values: &[Option<f64>], window_secs: u64) -> RollingStats {
    let n = timestamps.len().min(values.len());
    let window = i64::try_from(window_secs).unwrap_or(i64::MAX);
    let mut stats = RollingStats {
        mean: Vec::with_capacity(n),
        std: Vec::with_capacity(n),
        min: Vec::with_capacity(n),
        max: Vec::with_capacity(n),
    };

    let mut start = 0;
    for i in 0..n {
        while start < i && timestamps[start] <= timestamps[i].saturating_sub(window) {
            start += 1;
        }
        let observed: Vec<f64> = values[start..=i].iter().flatten().copied().collect();
        if observed.is_empty() {
            stats.mean.push(None);
            stats.std.push(None);
            stats.min.push(None);
            stats.max.push(None);
            continue;
        }
        let count = observed.len() as f64;
        let mean = observed.iter().sum::<f64>() / count;
        stats.mean.push(Some(mean));
        stats.std.push((observed.len() > 1).then(|| {
            let ss: f64 = observed.iter().map(|v| (v - mean).powi(2)).sum();
            (ss / (count - 1.0)).sqrt()
        }));
        stats.min.push(observed.iter().copied().reduce(f64::min));
        stats.max.push(observed.iter().copied().reduce(f64::max));
    }

    backward_fill(&mut stats.mean);
    backward_fill(&mut stats.std);
    backward_fill(&mut stats.min);
    backward_fill(&mut stats.max);
    for value in stats.std.iter_mut().filter(|v| v.is_none()) {
        *value = Some(0.0);
    }
    stats
}

/// Values shifted forward by each lag, backward-filled at the head
///
/// For lag `k`, row `i >= k` holds `values[i - k]`; earlier rows hold the
/// first shifted value. If the series is no longer than `k` there is no
/// shifted value at all and the first observed value is used.
pub fn lag_features(values: &[Option<f64>], lags: &[usize]) -> Vec<(usize, Vec<Option<f64>>)> {
    let first_observed = values.iter().flatten().next().copied();
    lags.iter()
        .map(|&lag| {
            let mut shifted: Vec<Option<f64>> = (0..values.len())
                .map(|i| if i >= lag { values[i - lag] } else { None })
                .collect();
            backward_fill(&mut shifted);
            for value in shifted.iter_mut().filter(|v| v.is_none()) {
                *value = first_observed;
            }
            (lag, shifted)
        })
        .collect()
}

/// Three largest real-DFT magnitudes of the observed values, descending
///
/// Fewer than [`MIN_SPECTRAL_SAMPLES`] observations yields zeros.
pub fn fft_energy(values: &[Option<f64>]) -> [f64; SPECTRAL_COLUMNS] {
    let observed: Vec<f64> = values.iter().flatten().copied().collect();
    if observed.len() < MIN_SPECTRAL_SAMPLES {
        return [0.0; SPECTRAL_COLUMNS];
    }

    let mut magnitudes = rfft_magnitudes(&observed);
    magnitudes.sort_by(|a, b| b.total_cmp(a));
    let mut top = [0.0; SPECTRAL_COLUMNS];
    for (slot, magnitude) in top.iter_mut().zip(magnitudes) {
        *slot = magnitude;
    }
    top
}

/// Magnitudes of the non-negative frequency terms, `n / 2 + 1` of them
fn rfft_magnitudes(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    (0..=n / 2)
        .map(|k| {
            let (re, im) = values.iter().enumerate().fold((0.0, 0.0), |(re, im), (j, x)| {
                let angle = -2.0 * PI * (k * j % n) as f64 / n as f64;
                (re + x * angle.cos(), im + x * angle.sin())
            });
            re.hypot(im)
        })
        .collect()
}
