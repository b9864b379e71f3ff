//! Anomaly detector CLI
//!
//! Trains and publishes model bundles, and inspects or reloads a running
//! detector.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{model, train};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Anomaly detector CLI
#[derive(Parser)]
#[command(name = "adctl")]
#[command(author, version, about = "CLI for the infrastructure anomaly detector", long_about = None)]
pub struct Cli {
    /// Detector API URL
    #[arg(long, env = "ADCTL_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a model bundle from Prometheus data and save it
    Train {
        /// Prometheus base URL
        #[arg(long, env = "DETECTOR_PROMETHEUS_URL", default_value = "http://prometheus:9090")]
        prometheus_url: String,

        /// Artifact store directory
        #[arg(long, env = "DETECTOR_MODEL_DIR", default_value = "/var/lib/anomaly-detector/models")]
        model_dir: PathBuf,

        /// Hours of history to train on
        #[arg(long, default_value_t = 6)]
        window_hours: u64,

        /// Query resolution in seconds
        #[arg(long, default_value_t = 60)]
        step_secs: u64,

        /// Bundle version (defaults to v<unix-ts>)
        #[arg(long)]
        version: Option<String>,

        /// Number of bundle versions to keep
        #[arg(long, default_value_t = 5)]
        keep: usize,

        /// Prometheus request timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,

        /// Ask the detector to reload after saving
        #[arg(long)]
        reload: bool,
    },

    /// Show the bundle the detector is serving
    Status,

    /// Make the detector reload the latest bundle
    Reload,

    /// List bundles in the artifact store
    Versions {
        /// Artifact store directory
        #[arg(long, env = "DETECTOR_MODEL_DIR", default_value = "/var/lib/anomaly-detector/models")]
        model_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let client = client::ApiClient::new(&cli.api_url)?;

    let result = match cli.command {
        Commands::Train {
            prometheus_url,
            model_dir,
            window_hours,
            step_secs,
            version,
            keep,
            timeout_secs,
            reload,
        } => {
            let args = train::TrainArgs {
                prometheus_url,
                model_dir,
                window_hours,
                step_secs,
                version,
                keep,
                timeout_secs,
                reload,
            };
            train::run(args, &client, cli.format).await
        }
        Commands::Status => model::show_status(&client, cli.format).await,
        Commands::Reload => model::reload(&client, cli.format).await,
        Commands::Versions { model_dir } => model::show_versions(&model_dir, cli.format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}
