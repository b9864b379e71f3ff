//! Prometheus HTTP API client

use super::{MetricSource, QueryWindow};
use crate::error::{DetectorError, Result};
use crate::models::{MetricSeries, Sample};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// [`MetricSource`] backed by `/api/v1/query_range`
#[derive(Debug, Clone)]
pub struct PrometheusSource {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<RangeSeries>,
}

#[derive(Debug, Deserialize)]
struct RangeSeries {
    #[serde(default)]
    metric: HashMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

impl PrometheusSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| DetectorError::Source(format!("invalid Prometheus URL {}: {}", base_url, e)))?;
        // keep any path prefix when joining the API path
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DetectorError::Source(format!("failed to create HTTP client: {}", e)))?;

        info!(url = %base_url, timeout_secs = timeout.as_secs(), "Prometheus source configured");
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[async_trait]
impl MetricSource for PrometheusSource {
    async fn query_range(
        &self,
        name: &str,
        query: &str,
        window: QueryWindow,
    ) -> Result<MetricSeries> {
        let url = self
            .base_url
            .join("api/v1/query_range")
            .map_err(|e| DetectorError::Source(e.to_string()))?;
        let params = [
            ("query", query.to_string()),
            ("start", window.start.timestamp().to_string()),
            ("end", window.end.timestamp().to_string()),
            ("step", format!("{}s", window.step.as_secs().max(1))),
        ];

        debug!(metric = %name, query = %query, "Querying Prometheus");
        let response = self
            .client
            .get(url)
            .query(&params)
            .send()
            .await
            .map_err(|e| DetectorError::Source(format!("request for {} failed: {}", name, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectorError::Source(format!(
                "Prometheus returned {} for {}: {}",
                status, name, body
            )));
        }

        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| DetectorError::Source(format!("invalid response for {}: {}", name, e)))?;
        if body.status != "success" {
            return Err(DetectorError::Source(format!(
                "query for {} failed: {}",
                name,
                body.error.unwrap_or_else(|| body.status.clone())
            )));
        }

        let result = body.data.map(|d| d.result).unwrap_or_default();
        let labels = result.first().map(|s| s.metric.clone()).unwrap_or_default();
        let mut samples = Vec::new();
        for series in result {
            for (timestamp, value) in series.values {
                let value: f64 = value.parse().map_err(|_| {
                    DetectorError::Source(format!("non-numeric sample {:?} for {}", value, name))
                })?;
                samples.push(Sample::new(timestamp as i64, value));
            }
        }

        debug!(metric = %name, samples = samples.len(), "Prometheus query complete");
        Ok(MetricSeries::new(name, samples).with_labels(labels))
    }
}
