use polars::error::PolarsError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrisisError {
    /// A referenced data or model file does not exist.
    #[error("File not found: {}", .path.display())]
    NotFound { path: PathBuf },

    /// An operation ran before the step it depends on.
    #[error("Invalid state: {0}")]
    State(String),

    /// A required column or setting is missing or unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A fit or metric computation cannot proceed on the given data.
    #[error("Computation error: {0}")]
    Computation(String),

    #[error("Data loading error: {0}")]
    DataLoading(#[from] PolarsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, CrisisError>;

impl CrisisError {
    pub(crate) fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }
}
