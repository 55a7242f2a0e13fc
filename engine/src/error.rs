//! Error types for the docsync engine.

use thiserror::Error;

/// All possible errors from the docsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Query errors
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("query cannot be evaluated locally: {0}")]
    UnsupportedLocally(String),

    // Document errors
    #[error("document is missing an _id")]
    MissingIdentifier,

    #[error("corrupt document: {0}")]
    CorruptDocument(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
