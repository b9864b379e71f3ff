//! Error taxonomy for feature extraction, scoring and model loading
//!
//! Request-scoped errors (`Data`, `SchemaMismatch`, `Prediction`) never touch
//! coordinator state. `ModelLoad` is the only class recorded on the
//! coordinator, and it never discards a working bundle.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DetectorError>;

#[derive(Debug, Clone, Error)]
pub enum DetectorError {
    /// Malformed or empty raw metric input
    #[error("invalid metric data: {0}")]
    Data(String),

    /// Serving-time columns differ from the columns the bundle was fitted on
    #[error("feature schema mismatch: expected {expected:?}, got {actual:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// Predict called before any bundle was loaded
    #[error("model not loaded")]
    ModelNotLoaded,

    /// Artifact missing, corrupt or partially written
    #[error("failed to load model bundle: {0}")]
    ModelLoad(String),

    /// Unexpected failure inside a scorer on structurally valid input
    #[error("prediction failed: {0}")]
    Prediction(String),

    /// Predict called after shutdown began
    #[error("detector is shutting down")]
    ShuttingDown,

    /// The metric source could not be queried
    #[error("metric source error: {0}")]
    Source(String),

    /// A bundle could not be written to the artifact store
    #[error("failed to store model bundle: {0}")]
    Storage(String),
}

impl DetectorError {
    /// Stable snake_case name of the error class
    pub fn kind(&self) -> &'static str {
        match self {
            DetectorError::Data(_) => "data",
            DetectorError::SchemaMismatch { .. } => "schema_mismatch",
            DetectorError::ModelNotLoaded => "model_not_loaded",
            DetectorError::ModelLoad(_) => "model_load",
            DetectorError::Prediction(_) => "prediction",
            DetectorError::ShuttingDown => "shutting_down",
            DetectorError::Source(_) => "source",
            DetectorError::Storage(_) => "storage",
        }
    }

    /// Returns true if the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DetectorError::ModelNotLoaded | DetectorError::Source(_)
        )
    }
}
