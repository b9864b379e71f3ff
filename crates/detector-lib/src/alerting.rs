//! Alert emission for high anomaly scores
//!
//! Handles:
//! - Building Alertmanager alerts for scores above the critical threshold
//! - Deduplication of identical alerts within a configurable window
//! - Fire-and-forget delivery that never fails the scoring request

use crate::error::{DetectorError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Default critical threshold on the normalized score
pub const DEFAULT_CRITICAL_THRESHOLD: f64 = 0.95;

/// Default deduplication window (15 minutes)
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 15 * 60;

const ALERT_NAME: &str = "HighAnomalyScore";
const RUNBOOK_URL: &str = "https://wiki.example.com/runbooks/high-anomaly";

/// Alertmanager alert, as accepted by `POST /api/v2/alerts`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerAlert {
    /// Alert labels for routing and grouping
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Start time in RFC3339 format
    pub starts_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<String>,
    #[serde(rename = "generatorURL", skip_serializing_if = "Option::is_none")]
    pub generator_url: Option<String>,
}

/// Builds and delivers alerts, suppressing repeats
pub struct AlertGenerator {
    threshold: f64,
    dedup_window: Duration,
    /// label set -> last emission time
    recent_alerts: Mutex<HashMap<BTreeMap<String, String>, Instant>>,
    sink: Option<(Client, Url)>,
}

impl std::fmt::Debug for AlertGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertGenerator")
            .field("threshold", &self.threshold)
            .field("dedup_window", &self.dedup_window)
            .field("sink", &self.sink.as_ref().map(|(_, url)| url.as_str()))
            .finish()
    }
}

impl Default for AlertGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CRITICAL_THRESHOLD)
    }
}

impl AlertGenerator {
    /// Create a generator with the default 15-minute deduplication window
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            dedup_window: Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS),
            recent_alerts: Mutex::new(HashMap::new()),
            sink: None,
        }
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Deliver alerts to the Alertmanager at `url`
    pub fn with_sink(mut self, url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .and_then(|u| u.join("/api/v2/alerts"))
            .map_err(|e| DetectorError::Source(format!("invalid Alertmanager URL {}: {}", url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DetectorError::Source(format!("failed to create HTTP client: {}", e)))?;
        info!(url = %url, "Alertmanager sink configured");
        self.sink = Some((client, url));
        Ok(self)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Alerts for every score above the threshold, minus recent duplicates
    pub fn alerts_for(
        &self,
        scores: &[f64],
        labels: &HashMap<String, String>,
    ) -> Vec<AlertmanagerAlert> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut recent = self
            .recent_alerts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        recent.retain(|_, at| at.elapsed() < self.dedup_window);

        let mut alerts = Vec::new();
        for (index, score) in scores.iter().enumerate() {
            if *score <= self.threshold {
                continue;
            }

            let mut alert_labels: BTreeMap<String, String> = labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            alert_labels.insert("alertname".to_string(), ALERT_NAME.to_string());
            alert_labels.insert("severity".to_string(), "critical".to_string());
            alert_labels.insert("row_index".to_string(), index.to_string());

            if recent.contains_key(&alert_labels) {
                debug!(row_index = index, score, "Suppressing duplicate alert");
                continue;
            }
            recent.insert(alert_labels.clone(), Instant::now());

            let mut annotations = BTreeMap::new();
            annotations.insert(
                "summary".to_string(),
                format!("Anomaly score {:.2} exceeds threshold {:.2}", score, self.threshold),
            );
            annotations.insert("runbook".to_string(), RUNBOOK_URL.to_string());

            alerts.push(AlertmanagerAlert {
                labels: alert_labels,
                annotations,
                starts_at: now.clone(),
                ends_at: None,
                generator_url: None,
            });
        }
        alerts
    }

    /// Post alerts to the sink and report the outcome
    pub async fn post(&self, alerts: &[AlertmanagerAlert]) -> Result<()> {
        let Some((client, url)) = &self.sink else {
            return Ok(());
        };
        deliver(client, url, alerts).await
    }

    /// Post alerts in the background; failures are only logged
    pub fn send(&self, alerts: Vec<AlertmanagerAlert>) -> Option<JoinHandle<()>> {
        if alerts.is_empty() {
            return None;
        }
        let Some((client, url)) = self.sink.clone() else {
            debug!(count = alerts.len(), "No alert sink configured, dropping alerts");
            return None;
        };
        Some(tokio::spawn(async move {
            if let Err(e) = deliver(&client, &url, &alerts).await {
                warn!(error = %e, count = alerts.len(), "Failed to deliver alerts");
            }
        }))
    }
}

async fn deliver(client: &Client, url: &Url, alerts: &[AlertmanagerAlert]) -> Result<()> {
    let response = client
        .post(url.clone())
        .json(alerts)
        .send()
        .await
        .map_err(|e| DetectorError::Source(format!("alert delivery failed: {}", e)))?;
    if !response.status().is_success() {
        return Err(DetectorError::Source(format!(
            "Alertmanager returned {}",
            response.status()
        )));
    }
    info!(count = alerts.len(), "Alerts delivered");
    Ok(())
}
