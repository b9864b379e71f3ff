//! Anomaly detector - scores infrastructure metrics against a hot-reloaded model
//!
//! Serves predictions over HTTP, reloads the model bundle from the artifact
//! store on demand and on a timer, and drains in-flight work on shutdown.

use anomaly_detector::{api, config::DetectorConfig, context::AppContext};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DETECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting anomaly-detector");

    let config = DetectorConfig::load()?;
    info!(
        instance = %config.instance,
        environment = %config.environment,
        model_dir = %config.model_dir.display(),
        feature_engine = ?config.feature_engine,
        "Detector configured"
    );

    let ctx = Arc::new(
        AppContext::from_config(&config)
            .await
            .context("Failed to initialize detector")?,
    );

    // A missing or broken bundle is not fatal: the service starts unloaded
    // and picks up a bundle on the next reload.
    let model_version = match ctx.coordinator.load().await {
        Ok(info) => info.version,
        Err(e) => {
            warn!(error = %e, "No model bundle loaded at startup");
            None
        }
    };
    ctx.logger
        .log_startup(DETECTOR_VERSION, model_version.as_deref());
    ctx.warn_on_feature_mismatch();

    let reload_handle = (config.reload_interval_secs > 0).then(|| {
        ctx.coordinator
            .spawn_periodic_reload(Duration::from_secs(config.reload_interval_secs))
    });

    let token = ctx.coordinator.shutdown_token();
    let api_handle = tokio::spawn(api::serve(config.api_port, ctx.clone(), async move {
        token.cancelled().await
    }));

    tokio::signal::ctrl_c().await?;
    ctx.logger.log_shutdown("SIGINT received");

    // Stops new work and waits for in-flight predictions
    ctx.coordinator.shutdown().await;

    if let Some(handle) = reload_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Periodic reload task failed");
        }
    }
    api_handle.await.context("API server task panicked")??;

    info!("Shutdown complete");
    Ok(())
}
