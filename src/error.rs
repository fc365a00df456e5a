//! Error types for campaign-etl
//!
//! Fatal errors (schema, integrity, configuration, precondition) propagate to the
//! caller unchanged. `CacheInvalid` stays inside the cache layer, where it turns a
//! load into a miss and the dataset is rebuilt from source.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// campaign-etl error types
#[derive(Error, Debug)]
pub enum Error {
    /// Produced table columns don't match the declared dataset schema
    #[error("Schema error in {dataset}: {message}")]
    Schema {
        /// Dataset name
        dataset: String,
        /// What did not match
        message: String,
    },

    /// Referential invariant violated or unexpected empty dataset
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// Cached artifact is stale or unreadable (internal: triggers a rebuild)
    #[error("Invalid cache: {0}")]
    CacheInvalid(String),

    /// Malformed configuration or plugin contract violation
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Dataset accessed before the required extraction completed
    #[error("Precondition failed: {0}\nCall Repository::extract_all() first.")]
    Precondition(String),

    /// Write attempted through a read-only cache manager
    #[error("Read-only cache: cannot dump {0}")]
    ReadOnlyCache(String),

    /// Storage error (Parquet files, cache directories)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a [`Error::Schema`] for the given dataset
    pub fn schema(dataset: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            dataset: dataset.into(),
            message: message.into(),
        }
    }

    /// Build a [`Error::Configuration`] naming the offending function
    pub fn function(function: &str, message: impl std::fmt::Display) -> Self {
        Self::Configuration(format!("function {function:?}: {message}"))
    }
}
