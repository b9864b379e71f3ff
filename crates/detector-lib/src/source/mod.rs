//! Metric sources feeding the feature transform
//!
//! A source answers range queries with one [`MetricSeries`] per query. The
//! default metric set is what training and the default-metrics endpoint pull.

mod prometheus;

pub use self::prometheus::PrometheusSource;

use crate::error::Result;
use crate::features::RawMetrics;
use crate::models::MetricSeries;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default lookback for pulled metrics (6 hours)
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(6 * 60 * 60);

/// Default query resolution (1 minute)
pub const DEFAULT_STEP: Duration = Duration::from_secs(60);

/// Node-level queries making up the default metric set
pub const DEFAULT_QUERIES: &[(&str, &str)] = &[
    ("cpu", r#"avg(rate(node_cpu_seconds_total{mode!="idle"}[5m]))"#),
    (
        "memory",
        "avg(1 - (node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes))",
    ),
    ("disk", "avg(rate(node_disk_io_time_seconds_total[5m]))"),
    ("network_rx", "sum(rate(node_network_receive_bytes_total[5m]))"),
    ("network_tx", "sum(rate(node_network_transmit_bytes_total[5m]))"),
];

/// Time range and resolution of a range query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub step: Duration,
}

impl QueryWindow {
    /// Window of length `length` ending now
    pub fn trailing(length: Duration, step: Duration) -> Self {
        let end = Utc::now();
        let start = end - chrono::Duration::from_std(length).unwrap_or_else(|_| chrono::Duration::zero());
        Self { start, end, step }
    }
}

impl Default for QueryWindow {
    fn default() -> Self {
        Self::trailing(DEFAULT_WINDOW, DEFAULT_STEP)
    }
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Run one range query and name the resulting series `name`
    ///
    /// When the query returns several series their samples are merged, the
    /// last series winning on equal timestamps.
    async fn query_range(&self, name: &str, query: &str, window: QueryWindow)
        -> Result<MetricSeries>;

    /// Pull every metric of [`DEFAULT_QUERIES`] over `window`
    async fn default_metrics(&self, window: QueryWindow) -> Result<RawMetrics> {
        let mut raw = RawMetrics::new();
        for (name, query) in DEFAULT_QUERIES {
            let series = self.query_range(name, query, window).await?;
            raw.insert(name.to_string(), series);
        }
        Ok(raw)
    }
}
