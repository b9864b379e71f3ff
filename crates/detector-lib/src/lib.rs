//! Core library for infrastructure metric anomaly detection
//!
//! This crate provides:
//! - Feature engineering over raw metric series
//! - Point (isolation forest) and sequence-residual (LSTM) scorers and their ensemble
//! - Versioned model bundles and a filesystem artifact store
//! - Hot reload of the active bundle with atomic publication
//! - Metric source and alert sink clients, and the training job
//! - Health checks and observability

pub mod alerting;
pub mod bundle;
pub mod error;
pub mod features;
pub mod health;
pub mod models;
pub mod observability;
pub mod reload;
pub mod scoring;
pub mod source;
pub mod training;

pub use alerting::{AlertGenerator, AlertmanagerAlert};
pub use bundle::{ArtifactStore, FsArtifactStore, ModelBundle, StoreConfig};
pub use error::{DetectorError, Result};
pub use features::{
    select_transformer, validate_features, FeatureConfig, FeatureEngine, FeatureEngineer,
    FeatureTransformer, RawMetrics,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{DetectorMetrics, StructuredLogger};
pub use reload::{DetectorInfo, HotReloadCoordinator, Prediction, ServingState};
pub use scoring::{EnsembleConfig, EnsembleScorer, EnsembleWeights};
pub use source::{MetricSource, PrometheusSource, QueryWindow};
pub use training::{Trainer, TrainingConfig, TrainingReport};
