use thiserror::Error;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Archive error: {0}")]
    ArchiveError(String),

    #[error("Tensor '{0}' is already registered in the workspace")]
    DuplicateTensor(String),

    #[error("Tensor '{0}' not found in the workspace")]
    TensorNotFound(String),

    #[error("Invalid operator: {0}")]
    InvalidOperator(String),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Failed to load {0}: {1}")]
    LoadError(PathBuf, String),
}
