//! Detector configuration
//!
//! Values come from an optional file named by `DETECTOR_CONFIG_FILE`, then
//! environment variables prefixed `DETECTOR_` (nested keys use `__`, e.g.
//! `DETECTOR_FEATURES__ROLLING_WINDOW_SECS`).

use anyhow::{ensure, Context, Result};
use detector_lib::features::{FeatureConfig, FeatureEngine};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming an optional config file
pub const CONFIG_FILE_ENV: &str = "DETECTOR_CONFIG_FILE";

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Instance name used in structured logs
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Port for the HTTP API, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Directory of the filesystem artifact store
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    #[serde(default = "default_versions_to_keep")]
    pub bundle_versions_to_keep: usize,

    /// Seconds between background reloads, 0 disables them
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    #[serde(default = "default_prometheus_url")]
    pub prometheus_url: String,

    #[serde(default = "default_prometheus_timeout")]
    pub prometheus_timeout_secs: u64,

    /// Normalized score above which a prediction is flagged
    #[serde(default = "default_threshold_warning")]
    pub threshold_warning: f64,

    /// Normalized score above which an alert is sent
    #[serde(default = "default_threshold_critical")]
    pub threshold_critical: f64,

    #[serde(default)]
    pub alertmanager_url: Option<String>,

    #[serde(default)]
    pub feature_engine: FeatureEngine,

    #[serde(default)]
    pub features: FeatureConfig,

    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("/var/lib/anomaly-detector/models")
}

fn default_versions_to_keep() -> usize {
    5
}

fn default_reload_interval() -> u64 {
    300
}

fn default_prometheus_url() -> String {
    "http://prometheus:9090".to_string()
}

fn default_prometheus_timeout() -> u64 {
    30
}

fn default_threshold_warning() -> f64 {
    0.7
}

fn default_threshold_critical() -> f64 {
    0.95
}

fn default_environment() -> String {
    "production".to_string()
}

impl DetectorConfig {
    /// Load configuration from the environment and the optional config file
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::load_from(file.as_deref())
    }

    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("DETECTOR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("features.lags"),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: DetectorConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.threshold_warning > 0.0 && self.threshold_warning <= self.threshold_critical,
            "threshold_warning must be positive and not above threshold_critical"
        );
        ensure!(
            self.threshold_critical <= 1.0,
            "threshold_critical must not exceed 1.0"
        );
        ensure!(
            self.bundle_versions_to_keep > 0,
            "bundle_versions_to_keep must be at least 1"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = DetectorConfig::load_from(None).unwrap();
        assert_eq!(config.threshold_critical, 0.95);
        assert_eq!(config.feature_engine, FeatureEngine::Primary);
        assert_eq!(config.features, FeatureConfig::default());
    }

    #[test]
    fn test_file_values() {
        let file = write_config(
            r#"
api_port = 9100
model_dir = "/tmp/models"
reload_interval_secs = 60
feature_engine = "builtin"
alertmanager_url = "http://alertmanager:9093"

[features]
rolling_window_secs = 600
lags = [1, 3]
"#,
        );
        let config = DetectorConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.model_dir, PathBuf::from("/tmp/models"));
        assert_eq!(config.feature_engine, FeatureEngine::Builtin);
        assert_eq!(config.features.lags, vec![1, 3]);
        assert_eq!(config.alertmanager_url.as_deref(), Some("http://alertmanager:9093"));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let file = write_config("threshold_warning = 0.9\nthreshold_critical = 0.5\n");
        assert!(DetectorConfig::load_from(Some(file.path())).is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(DetectorConfig::load_from(Some(Path::new("/nonexistent/detector.toml"))).is_err());
    }
}
