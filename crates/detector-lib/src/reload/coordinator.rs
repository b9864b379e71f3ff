//! Ownership and atomic replacement of the active model bundle
//!
//! All state the coordinator exposes lives in one immutable [`DetectorState`]
//! snapshot behind an [`ArcSwap`]. A reload builds the next snapshot off to
//! the side and publishes it with a single store, so readers see either the
//! old or the new bundle, never a mixture.

use crate::bundle::{ArtifactStore, ModelBundle};
use crate::error::{DetectorError, Result};
use crate::features::FeatureConfig;
use crate::health::{components, HealthRegistry};
use crate::models::FeatureMatrix;
use crate::observability::DetectorMetrics;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serving state derived from the current snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServingState {
    /// No bundle has ever loaded
    Unloaded,
    Ready,
    /// Serving a bundle, but the latest load attempt failed
    Degraded,
}

impl ServingState {
    /// Numeric code exported on the state gauge
    pub fn code(&self) -> i64 {
        match self {
            ServingState::Unloaded => 0,
            ServingState::Ready => 1,
            ServingState::Degraded => 2,
        }
    }
}

/// The coordinator's view: current bundle, when it loaded, last load error
#[derive(Debug, Clone, Default)]
pub struct DetectorState {
    pub bundle: Option<Arc<ModelBundle>>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DetectorState {
    pub fn serving_state(&self) -> ServingState {
        match (&self.bundle, &self.last_error) {
            (None, _) => ServingState::Unloaded,
            (Some(_), None) => ServingState::Ready,
            (Some(_), Some(_)) => ServingState::Degraded,
        }
    }
}

/// Snapshot returned by [`HotReloadCoordinator::info`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorInfo {
    pub state: ServingState,
    pub version: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub degraded: bool,
    pub last_error: Option<String>,
    pub feature_columns: Vec<String>,
    pub feature_config: Option<FeatureConfig>,
    pub lookback: Option<usize>,
}

impl From<&DetectorState> for DetectorInfo {
    fn from(state: &DetectorState) -> Self {
        let bundle = state.bundle.as_deref();
        let serving_state = state.serving_state();
        Self {
            state: serving_state,
            version: bundle.map(|b| b.version().to_string()),
            created_at: bundle.map(|b| b.created_at()),
            loaded_at: state.loaded_at,
            degraded: serving_state == ServingState::Degraded,
            last_error: state.last_error.clone(),
            feature_columns: bundle
                .map(|b| b.feature_columns().to_vec())
                .unwrap_or_default(),
            feature_config: bundle.and_then(|b| b.feature_config().cloned()),
            lookback: bundle.map(|b| b.ensemble().lookback()),
        }
    }
}

/// Scores from one bundle, tagged with that bundle's version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub model_version: String,
    pub timestamps: Vec<i64>,
    pub scores: Vec<f64>,
}

/// Owns the active bundle and swaps it on demand or on a schedule
pub struct HotReloadCoordinator {
    store: Arc<dyn ArtifactStore>,
    state: ArcSwap<DetectorState>,
    reload_lock: Mutex<()>,
    shutdown: CancellationToken,
    inflight: AtomicUsize,
    drained: Notify,
    metrics: Option<DetectorMetrics>,
    health: Option<HealthRegistry>,
}

impl std::fmt::Debug for HotReloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReloadCoordinator")
            .field("state", &self.state.load().serving_state())
            .field("inflight", &self.inflight.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl HotReloadCoordinator {
    /// Create an Unloaded coordinator reading from `store`
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            state: ArcSwap::from_pointee(DetectorState::default()),
            reload_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
            metrics: None,
            health: None,
        }
    }

    /// Report reloads and predictions on the Prometheus metrics
    pub fn with_metrics(mut self, metrics: DetectorMetrics) -> Self {
        metrics.set_state(ServingState::Unloaded.code());
        self.metrics = Some(metrics);
        self
    }

    /// Mirror the model component and readiness onto a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Load the latest bundle from the store
    ///
    /// On failure the previous bundle, if any, keeps serving and the error is
    /// recorded. A call that arrives while another load is running waits for
    /// it and reports its outcome instead of reading the store again.
    pub async fn load(&self) -> Result<DetectorInfo> {
        if self.shutdown.is_cancelled() {
            return Err(DetectorError::ShuttingDown);
        }

        let _guard = match self.reload_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Reload already in progress, waiting for its outcome");
                let _done = self.reload_lock.lock().await;
                if self.shutdown.is_cancelled() {
                    return Err(DetectorError::ShuttingDown);
                }
                return self.last_outcome();
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.inc_reload_attempts();
        }

        let loaded = tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("Reload cancelled by shutdown");
                return Err(DetectorError::ShuttingDown);
            }
            loaded = self.store.load_latest() => loaded,
        };

        let previous = self.state.load_full();
        let old_version = previous.bundle.as_ref().map(|b| b.version().to_string());

        match loaded {
            Ok(bundle) => {
                let next = DetectorState {
                    bundle: Some(Arc::new(bundle)),
                    loaded_at: Some(Utc::now()),
                    last_error: None,
                };
                let info = DetectorInfo::from(&next);
                self.state.store(Arc::new(next));
                info!(
                    old_version = old_version.as_deref().unwrap_or("none"),
                    new_version = info.version.as_deref().unwrap_or("none"),
                    "Model bundle published"
                );
                self.report(&info).await;
                Ok(info)
            }
            Err(e) => {
                let message = match e {
                    DetectorError::ModelLoad(msg) => msg,
                    other => other.to_string(),
                };
                let next = DetectorState {
                    bundle: previous.bundle.clone(),
                    loaded_at: previous.loaded_at,
                    last_error: Some(message.clone()),
                };
                let info = DetectorInfo::from(&next);
                self.state.store(Arc::new(next));
                warn!(
                    current_version = old_version.as_deref().unwrap_or("none"),
                    state = ?info.state,
                    error = %message,
                    "Model bundle load failed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_reload_failures();
                }
                self.report(&info).await;
                Err(DetectorError::ModelLoad(message))
            }
        }
    }

    /// Same as [`load`](Self::load); concurrent calls coalesce
    pub async fn reload(&self) -> Result<DetectorInfo> {
        self.load().await
    }

    /// Score `features` with the current bundle
    ///
    /// The bundle reference is captured once, so a reload that lands
    /// mid-call does not affect this prediction.
    pub fn predict(&self, features: &FeatureMatrix) -> Result<Prediction> {
        let _inflight = self.begin_prediction()?;
        let bundle = self.current().ok_or(DetectorError::ModelNotLoaded)?;
        let scored = bundle.score(features)?;
        Ok(Prediction {
            model_version: bundle.version().to_string(),
            timestamps: scored.timestamps,
            scores: scored.scores,
        })
    }

    /// The bundle new predictions would use
    pub fn current(&self) -> Option<Arc<ModelBundle>> {
        self.state.load().bundle.clone()
    }

    /// True whenever a bundle is available, degraded or not
    pub fn health(&self) -> bool {
        self.state.load().bundle.is_some()
    }

    pub fn state(&self) -> ServingState {
        self.state.load().serving_state()
    }

    pub fn info(&self) -> DetectorInfo {
        DetectorInfo::from(&**self.state.load())
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled when shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Reload every `every` until shutdown
    ///
    /// The first attempt happens one interval after the call.
    pub fn spawn_periodic_reload(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            info!(interval_secs = every.as_secs(), "Starting periodic bundle reload");
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Stopping periodic bundle reload");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.reload().await {
                            debug!(error = %e, "Periodic reload did not publish a bundle");
                        }
                    }
                }
            }
        })
    }

    /// Stop reloading, reject new predictions and wait for running ones
    pub async fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(inflight = self.inflight(), "Coordinator shutting down");
            self.shutdown.cancel();
        }

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inflight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        debug!("In-flight predictions drained");
    }

    pub(super) fn begin_prediction(&self) -> Result<InflightGuard<'_>> {
        let count = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = InflightGuard { coordinator: self };
        if self.shutdown.is_cancelled() {
            return Err(DetectorError::ShuttingDown);
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_inflight(count);
        }
        Ok(guard)
    }

    /// Outcome of the load that just finished, for coalesced callers
    fn last_outcome(&self) -> Result<DetectorInfo> {
        let state = self.state.load();
        match &state.last_error {
            Some(message) => Err(DetectorError::ModelLoad(message.clone())),
            None if state.bundle.is_some() => Ok(DetectorInfo::from(&**state)),
            None => Err(DetectorError::ModelNotLoaded),
        }
    }

    async fn report(&self, info: &DetectorInfo) {
        if let Some(metrics) = &self.metrics {
            metrics.set_state(info.state.code());
            if let Some(version) = &info.version {
                metrics.set_model_version(version);
            }
        }
        if let Some(health) = &self.health {
            match (info.state, &info.last_error) {
                (ServingState::Ready, _) => health.set_healthy(components::MODEL).await,
                (ServingState::Degraded, Some(e)) => {
                    health.set_degraded(components::MODEL, e.clone()).await
                }
                (_, e) => {
                    health
                        .set_unhealthy(
                            components::MODEL,
                            e.clone().unwrap_or_else(|| "no bundle loaded".to_string()),
                        )
                        .await
                }
            }
            health.set_ready(info.version.is_some()).await;
        }
    }
}

/// Decrements the in-flight count on drop and wakes a waiting shutdown
pub(super) struct InflightGuard<'a> {
    coordinator: &'a HotReloadCoordinator,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let remaining = self.coordinator.inflight.fetch_sub(1, Ordering::SeqCst) - 1;
        if let Some(metrics) = &self.coordinator.metrics {
            metrics.set_inflight(remaining);
        }
        if remaining == 0 {
            self.coordinator.drained.notify_waiters();
        }
    }
}
