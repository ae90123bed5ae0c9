//! Error types for the sfttune-core crate.

use thiserror::Error;

/// Top-level error type for pipeline operations.
///
/// Every variant is fatal to a pipeline run; there is no retry or resume path.
#[derive(Debug, Error)]
pub enum TuneError {
    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Dataset record {index} is missing required string field '{field}'")]
    MissingField { index: usize, field: String },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Adapter artifact error: {0}")]
    Artifact(String),

    #[error("Python runtime error: {0}")]
    Python(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl TuneError {
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    pub fn python(msg: impl Into<String>) -> Self {
        Self::Python(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TuneError>;
