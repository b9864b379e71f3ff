//! Core data models for the anomaly detector

use crate::error::{DetectorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single observation of a metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Raw time series for one metric
///
/// Samples are kept sorted by timestamp. Duplicate timestamps are collapsed
/// on construction, keeping the last sample seen for that timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "SeriesData")]
pub struct MetricSeries {
    pub name: String,
    samples: Vec<Sample>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// Wire form of [`MetricSeries`], normalized through [`MetricSeries::new`]
#[derive(Deserialize)]
struct SeriesData {
    name: String,
    #[serde(default)]
    samples: Vec<Sample>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

impl From<SeriesData> for MetricSeries {
    fn from(data: SeriesData) -> Self {
        MetricSeries::new(data.name, data.samples).with_labels(data.labels)
    }
}

impl MetricSeries {
    pub fn new(name: impl Into<String>, mut samples: Vec<Sample>) -> Self {
        // Stable sort keeps ingest order among equal timestamps so the
        // dedup below can keep the last one.
        samples.sort_by_key(|s| s.timestamp);
        let mut deduped: Vec<Sample> = Vec::with_capacity(samples.len());
        for sample in samples {
            match deduped.last_mut() {
                Some(last) if last.timestamp == sample.timestamp => *last = sample,
                _ => deduped.push(sample),
            }
        }
        Self {
            name: name.into(),
            samples: deduped,
            labels: HashMap::new(),
        }
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.samples.iter().map(|s| s.timestamp).collect()
    }

    /// Values with non-finite observations mapped to `None`
    pub fn values(&self) -> Vec<Option<f64>> {
        self.samples
            .iter()
            .map(|s| s.value.is_finite().then_some(s.value))
            .collect()
    }
}

/// One named feature column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn dense(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self::new(name, values.into_iter().map(Some).collect())
    }
}

/// Timestamp-keyed feature table with a fixed, ordered column set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MatrixData")]
pub struct FeatureMatrix {
    timestamps: Vec<i64>,
    columns: Vec<Column>,
}

#[derive(Deserialize)]
struct MatrixData {
    timestamps: Vec<i64>,
    columns: Vec<Column>,
}

impl TryFrom<MatrixData> for FeatureMatrix {
    type Error = DetectorError;

    fn try_from(data: MatrixData) -> Result<Self> {
        FeatureMatrix::new(data.timestamps, data.columns)
    }
}

impl FeatureMatrix {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(timestamps: Vec<i64>, columns: Vec<Column>) -> Result<Self> {
        for column in &columns {
            if column.values.len() != timestamps.len() {
                return Err(DetectorError::Data(format!(
                    "column {} has {} values for {} rows",
                    column.name,
                    column.values.len(),
                    timestamps.len()
                )));
            }
        }
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(DetectorError::Data(format!(
                    "duplicate column {}",
                    column.name
                )));
            }
        }
        Ok(Self {
            timestamps,
            columns,
        })
    }

    pub fn rows(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Values of one column, failing if it is absent or has gaps
    pub fn dense_column(&self, name: &str) -> Result<Vec<f64>> {
        let column = self
            .column(name)
            .ok_or_else(|| DetectorError::Data(format!("missing column {}", name)))?;
        column
            .values
            .iter()
            .enumerate()
            .map(|(row, v)| {
                v.ok_or_else(|| {
                    DetectorError::Data(format!("missing value in column {} at row {}", name, row))
                })
            })
            .collect()
    }

    /// Row-major dense copy, failing on any missing value
    pub fn to_dense(&self) -> Result<Vec<Vec<f64>>> {
        let mut rows = vec![Vec::with_capacity(self.columns.len()); self.rows()];
        for column in &self.columns {
            for (row, value) in column.values.iter().enumerate() {
                let value = value.ok_or_else(|| {
                    DetectorError::Data(format!(
                        "missing value in column {} at row {}",
                        column.name, row
                    ))
                })?;
                rows[row].push(value);
            }
        }
        Ok(rows)
    }

    /// Forward-fill then backward-fill every column
    ///
    /// Columns with no observation at all are left untouched.
    pub fn fill_gaps(&mut self) {
        for column in &mut self.columns {
            forward_fill(&mut column.values);
            backward_fill(&mut column.values);
        }
    }

    pub fn has_gaps(&self) -> bool {
        self.columns
            .iter()
            .any(|c| c.values.iter().any(Option::is_none))
    }

    /// Last `n` rows (or all rows if fewer)
    pub fn tail(&self, n: usize) -> Self {
        let start = self.rows().saturating_sub(n);
        Self {
            timestamps: self.timestamps[start..].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|c| Column::new(c.name.clone(), c.values[start..].to_vec()))
                .collect(),
        }
    }
}

/// Replace each `None` with the nearest later value
pub fn backward_fill(values: &mut [Option<f64>]) {
    let mut next = None;
    for value in values.iter_mut().rev() {
        match value {
            Some(v) => next = Some(*v),
            None => *value = next,
        }
    }
}

/// Replace each `None` with the nearest earlier value
pub fn forward_fill(values: &mut [Option<f64>]) {
    let mut prev = None;
    for value in values.iter_mut() {
        match value {
            Some(v) => prev = Some(*v),
            None => *value = prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_sorted_and_last_wins() {
        let series = MetricSeries::new(
            "cpu",
            vec![
                Sample::new(120, 3.0),
                Sample::new(60, 1.0),
                Sample::new(120, 4.0),
                Sample::new(0, 0.5),
            ],
        );
        assert_eq!(series.timestamps(), vec![0, 60, 120]);
        assert_eq!(series.samples()[2].value, 4.0);
    }

    #[test]
    fn test_non_finite_values_are_missing() {
        let series = MetricSeries::new("cpu", vec![Sample::new(0, f64::NAN), Sample::new(60, 1.0)]);
        assert_eq!(series.values(), vec![None, Some(1.0)]);
    }

    #[test]
    fn test_matrix_rejects_ragged_columns() {
        let result = FeatureMatrix::new(vec![0, 60], vec![Column::dense("a", vec![1.0])]);
        assert!(matches!(result, Err(DetectorError::Data(_))));
    }

    #[test]
    fn test_matrix_rejects_duplicate_columns() {
        let result = FeatureMatrix::new(
            vec![0],
            vec![Column::dense("a", vec![1.0]), Column::dense("a", vec![2.0])],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_fill_gaps() {
        let mut m = FeatureMatrix::new(
            vec![0, 60, 120, 180],
            vec![Column::new("a", vec![None, Some(1.0), None, Some(3.0)])],
        )
        .unwrap();
        assert!(m.has_gaps());
        m.fill_gaps();
        assert!(!m.has_gaps());
        assert_eq!(
            m.column("a").unwrap().values,
            vec![Some(1.0), Some(1.0), Some(1.0), Some(3.0)]
        );
    }

    #[test]
    fn test_to_dense_row_major() {
        let m = FeatureMatrix::new(
            vec![0, 60],
            vec![Column::dense("a", vec![1.0, 2.0]), Column::dense("b", vec![3.0, 4.0])],
        )
        .unwrap();
        assert_eq!(m.to_dense().unwrap(), vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
    }

    #[test]
    fn test_tail() {
        let m = FeatureMatrix::new(
            vec![0, 60, 120],
            vec![Column::dense("a", vec![1.0, 2.0, 3.0])],
        )
        .unwrap();
        let t = m.tail(2);
        assert_eq!(t.timestamps(), &[60, 120]);
        assert_eq!(t.dense_column("a").unwrap(), vec![2.0, 3.0]);
        assert_eq!(m.tail(10).rows(), 3);
    }

    #[test]
    fn test_deserialized_series_sorted_and_last_wins() {
        let series: MetricSeries = serde_json::from_str(
            r#"{"name":"cpu","samples":[
                {"timestamp":120,"value":1.0},
                {"timestamp":60,"value":2.0},
                {"timestamp":120,"value":3.0}]}"#,
        )
        .unwrap();
        assert_eq!(series.timestamps(), vec![60, 120]);
        assert_eq!(series.values(), vec![Some(2.0), Some(3.0)]);
        assert!(series.labels.is_empty());
    }

    #[test]
    fn test_series_serde_keeps_labels() {
        let series = MetricSeries::new("cpu", vec![Sample::new(0, 1.0)])
            .with_labels(HashMap::from([("host".to_string(), "a".to_string())]));
        let restored: MetricSeries =
            serde_json::from_str(&serde_json::to_string(&series).unwrap()).unwrap();
        assert_eq!(restored.labels["host"], "a");
        assert_eq!(restored.samples(), series.samples());
    }

    #[test]
    fn test_deserialize_rejects_ragged_matrix() {
        let ragged = r#"{"timestamps":[0,60],"columns":[{"name":"a","values":[1.0]}]}"#;
        assert!(serde_json::from_str::<FeatureMatrix>(ragged).is_err());

        let duplicate = r#"{"timestamps":[0],"columns":[
            {"name":"a","values":[1.0]},{"name":"a","values":[2.0]}]}"#;
        assert!(serde_json::from_str::<FeatureMatrix>(duplicate).is_err());

        let valid = r#"{"timestamps":[0],"columns":[{"name":"a","values":[null]}]}"#;
        let matrix: FeatureMatrix = serde_json::from_str(valid).unwrap();
        assert_eq!(matrix.rows(), 1);
    }
}
