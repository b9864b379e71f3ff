//! Training job: pull metrics from Prometheus and publish a new bundle

use anyhow::{Context, Result};
use detector_lib::{
    bundle::{FsArtifactStore, StoreConfig},
    reload::DetectorInfo,
    source::PrometheusSource,
    training::{Trainer, TrainingConfig, TrainingReport},
};
use std::path::PathBuf;
use std::time::Duration;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{format_score, print_json, print_success, print_warning, OutputFormat};

/// Arguments of `adctl train`
#[derive(Debug, Clone)]
pub struct TrainArgs {
    pub prometheus_url: String,
    pub model_dir: PathBuf,
    pub window_hours: u64,
    pub step_secs: u64,
    pub version: Option<String>,
    pub keep: usize,
    pub timeout_secs: u64,
    /// Ask the detector at the API URL to reload once saved
    pub reload: bool,
}

#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "Field")]
    field: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

impl TrainArgs {
    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            window: Duration::from_secs(self.window_hours * 3600),
            step: Duration::from_secs(self.step_secs),
            version: self.version.clone(),
            ..Default::default()
        }
    }
}

fn report_rows(report: &TrainingReport) -> Vec<ReportRow> {
    vec![
        ReportRow {
            field: "Version",
            value: report.version.clone(),
        },
        ReportRow {
            field: "Rows",
            value: report.rows.to_string(),
        },
        ReportRow {
            field: "Features",
            value: report.feature_columns.len().to_string(),
        },
        ReportRow {
            field: "Forecast MSE",
            value: format_score(report.sequence_mse),
        },
        ReportRow {
            field: "Mean score",
            value: format_score(report.mean_score),
        },
        ReportRow {
            field: "Duration",
            value: format!("{:.1}s", report.duration_secs),
        },
    ]
}

/// Run one training job and optionally trigger a reload
pub async fn run(args: TrainArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let source = PrometheusSource::new(&args.prometheus_url, Duration::from_secs(args.timeout_secs))
        .context("Failed to configure Prometheus source")?;
    let store = FsArtifactStore::new(StoreConfig {
        root: args.model_dir.clone(),
        versions_to_keep: args.keep,
    })
    .context("Failed to open artifact store")?;

    let trainer = Trainer::new(args.training_config());
    let report = trainer.run(&source, &store).await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            print_success(&format!(
                "Saved bundle {} to {}",
                report.version,
                args.model_dir.display()
            ));
            let table = tabled::Table::new(report_rows(&report))
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
        }
    }

    if args.reload {
        match client.post_empty::<DetectorInfo>("api/v1/reload").await {
            Ok(info) if info.version.as_deref() == Some(report.version.as_str()) => {
                print_success(&format!("Detector now serving {}", report.version));
            }
            Ok(info) => print_warning(&format!(
                "Detector reloaded but serves {}",
                info.version.as_deref().unwrap_or("-")
            )),
            Err(e) => print_warning(&format!("Reload request failed: {:#}", e)),
        }
    }

    Ok(())
}
