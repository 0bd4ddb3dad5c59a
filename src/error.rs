//! Error types for metricsdb.
//!
//! Driver failures are carried unchanged in their own variants so callers can
//! inspect the underlying engine error. Everything the layer itself refuses
//! (bad field names, unknown operators, unsafe native payloads) is reported
//! before any statement reaches a backend.

use crate::storage::BackendKind;
use thiserror::Error;

/// A specialized Result type for metricsdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for metricsdb operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An operation was attempted before `connect()` or after `disconnect()`.
    #[error("Database not connected. Call connect() first")]
    NotConnected,

    /// The generic query could not be translated safely into the native dialect.
    #[error("Translation rejected: {0}")]
    TranslationRejected(String),

    /// A native query payload failed the read-only check.
    #[error("Unsafe native query: {0}")]
    UnsafeNativeQuery(String),

    /// A write call reached an adapter configured read-only.
    #[error("Read-only mode: {0} is not permitted")]
    ReadOnly(&'static str),

    #[error("Invalid metric: {0}")]
    InvalidMetric(String),

    #[error("Operation '{operation}' is not supported by the {backend} backend")]
    Unsupported {
        backend: BackendKind,
        operation: &'static str,
    },

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("ADBC error: {0}")]
    Adbc(#[from] adbc_core::error::Error),

    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("BSON error: {0}")]
    Bson(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    pub fn rejected(msg: impl Into<String>) -> Self {
        Error::TranslationRejected(msg.into())
    }

    pub fn unsafe_native(msg: impl Into<String>) -> Self {
        Error::UnsafeNativeQuery(msg.into())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<bson::ser::Error> for Error {
    fn from(err: bson::ser::Error) -> Self {
        Error::Bson(err.to_string())
    }
}

impl From<bson::de::Error> for Error {
    fn from(err: bson::de::Error) -> Self {
        Error::Bson(err.to_string())
    }
}

impl From<bson::extjson::de::Error> for Error {
    fn from(err: bson::extjson::de::Error) -> Self {
        Error::Bson(err.to_string())
    }
}
