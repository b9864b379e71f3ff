//! Model status, reload and stored-version commands

use anyhow::{Context, Result};
use detector_lib::{
    bundle::{ArtifactStore, FsArtifactStore, StoreConfig, LATEST_POINTER},
    reload::DetectorInfo,
};
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{
    color_status, format_time, print_info, print_json, print_success, print_warning, OutputFormat,
};

/// Row for the status table
#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Field")]
    field: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

/// One stored bundle as listed by `versions`
#[derive(Debug, Clone, Serialize, Tabled)]
pub struct VersionRow {
    #[tabled(rename = "Version")]
    pub version: String,
    #[tabled(rename = "Created")]
    pub created_at: String,
    #[tabled(rename = "Columns")]
    pub columns: String,
    #[tabled(rename = "Latest")]
    pub latest: bool,
    #[tabled(rename = "Status")]
    pub status: String,
}

fn status_rows(info: &DetectorInfo) -> Vec<StatusRow> {
    let state = serde_json::to_value(info.state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    vec![
        StatusRow {
            field: "State",
            value: color_status(&state),
        },
        StatusRow {
            field: "Version",
            value: info.version.clone().unwrap_or_else(|| "-".to_string()),
        },
        StatusRow {
            field: "Created",
            value: format_time(info.created_at),
        },
        StatusRow {
            field: "Loaded",
            value: format_time(info.loaded_at),
        },
        StatusRow {
            field: "Lookback",
            value: info
                .lookback
                .map(|l| l.to_string())
                .unwrap_or_else(|| "-".to_string()),
        },
        StatusRow {
            field: "Features",
            value: info.feature_columns.len().to_string(),
        },
        StatusRow {
            field: "Trained with",
            value: info
                .feature_config
                .as_ref()
                .map(|f| format!("window {}s, lags {:?}", f.rolling_window_secs, f.lags))
                .unwrap_or_else(|| "-".to_string()),
        },
    ]
}

fn render_info(info: &DetectorInfo, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(info)?,
        OutputFormat::Table => {
            let table = tabled::Table::new(status_rows(info))
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
            if let Some(error) = &info.last_error {
                print_warning(&format!("Last reload failed: {}", error));
            }
        }
    }
    Ok(())
}

/// Show what the running detector is serving
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let info: DetectorInfo = client.get("api/v1/info").await?;
    render_info(&info, format)
}

/// Ask the running detector to reload its bundle
pub async fn reload(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let info: DetectorInfo = client.post_empty("api/v1/reload").await?;
    if let OutputFormat::Table = format {
        print_success(&format!(
            "Detector now serving {}",
            info.version.as_deref().unwrap_or("-")
        ));
    }
    render_info(&info, format)
}

/// Describe every bundle in a local artifact store, oldest first
pub async fn list_versions(model_dir: &Path) -> Result<Vec<VersionRow>> {
    let store = FsArtifactStore::new(StoreConfig {
        root: model_dir.to_path_buf(),
        ..Default::default()
    })
    .context("Failed to open artifact store")?;

    let latest = std::fs::read_to_string(model_dir.join(LATEST_POINTER))
        .ok()
        .map(|s| s.trim().to_string());

    let mut rows = Vec::new();
    for version in store.versions().await? {
        let row = match store.load_version(&version).await {
            Ok(bundle) => VersionRow {
                created_at: format_time(Some(bundle.created_at())),
                columns: bundle.feature_columns().len().to_string(),
                status: "ok".to_string(),
                latest: latest.as_deref() == Some(version.as_str()),
                version,
            },
            Err(e) => {
                tracing::debug!(version = %version, error = %e, "Bundle failed to load");
                VersionRow {
                    created_at: "-".to_string(),
                    columns: "-".to_string(),
                    status: "corrupt".to_string(),
                    latest: latest.as_deref() == Some(version.as_str()),
                    version,
                }
            }
        };
        rows.push(row);
    }
    Ok(rows)
}

/// Print the stored bundle versions
pub async fn show_versions(model_dir: &Path, format: OutputFormat) -> Result<()> {
    let rows = list_versions(model_dir).await?;

    match format {
        OutputFormat::Json => print_json(&rows)?,
        OutputFormat::Table => {
            if rows.is_empty() {
                print_warning(&format!("No bundles in {}", model_dir.display()));
                return Ok(());
            }
            let total = rows.len();
            let rows: Vec<VersionRow> = rows
                .into_iter()
                .map(|mut r| {
                    r.status = color_status(&r.status);
                    r
                })
                .collect();
            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
            print_info(&format!("Total: {} bundles", total));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_list_versions_empty_store() {
        let dir = TempDir::new().unwrap();
        assert!(list_versions(dir.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_versions_flags_corrupt_bundle() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("v1.bundle"), b"not a bundle").unwrap();
        std::fs::write(dir.path().join(LATEST_POINTER), "v1").unwrap();

        let rows = list_versions(dir.path()).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version, "v1");
        assert_eq!(rows[0].status, "corrupt");
        assert!(rows[0].latest);
    }

    #[test]
    fn test_status_rows_show_training_features() {
        let info: DetectorInfo = serde_json::from_str(
            r#"{"state":"ready","version":"v1","created_at":null,"loaded_at":null,
                "degraded":false,"last_error":null,"feature_columns":["cpu_raw"],
                "feature_config":{"rolling_window_secs":300,"lags":[1,5]},"lookback":8}"#,
        )
        .unwrap();

        let rows = status_rows(&info);
        let trained = rows.iter().find(|r| r.field == "Trained with").unwrap();
        assert_eq!(trained.value, "window 300s, lags [1, 5]");
    }

    #[test]
    fn test_status_rows_without_training_features() {
        let info: DetectorInfo = serde_json::from_str(
            r#"{"state":"unloaded","version":null,"created_at":null,"loaded_at":null,
                "degraded":false,"last_error":null,"feature_columns":[],"lookback":null}"#,
        )
        .unwrap();

        let rows = status_rows(&info);
        let trained = rows.iter().find(|r| r.field == "Trained with").unwrap();
        assert_eq!(trained.value, "-");
    }
}
