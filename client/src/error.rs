//! Unified error handling for the client.

use crate::config::ConfigError;
use crate::transport::TransportError;
use serde::Deserialize;

/// Error names the remote API uses when a delta-set request cannot be served.
const DELTA_SET_UNSUPPORTED: [&str; 3] = [
    "MissingConfiguration",
    "ParameterValueOutOfRange",
    "FeatureUnavailable",
];

/// Client error type.
///
/// Errors are `Clone` so that a push can hand the same failure back in
/// several per-item results.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{count} pending change(s) must be pushed before pulling")]
    PendingChanges { count: usize },

    #[error("A push is already in progress for collection {collection}")]
    SyncInProgress { collection: String },

    #[error("Document is missing an _id")]
    MissingIdentifier,

    #[error("Corrupt document: {0}")]
    CorruptDocument(String),

    #[error("Query cannot be evaluated locally: {0}")]
    UnsupportedLocally(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Entity at index {index} was rejected: {message}")]
    BatchItem { index: usize, message: String },

    #[error("Server error {status} ({name}): {message}")]
    Server {
        status: u16,
        name: String,
        message: String,
    },

    #[error("No active session")]
    NoActiveSession,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error body returned by the remote API.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    debug: Option<String>,
}

impl Error {
    /// Map a non-2xx response to a typed error.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
        let message = parsed
            .description
            .or(parsed.debug)
            .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());

        match (status, parsed.error) {
            (401, None) => Error::InvalidCredentials(message),
            (401, Some(name)) if name == "InvalidCredentials" => Error::InvalidCredentials(message),
            (404, _) => Error::NotFound(message),
            (status, name) => Error::Server {
                status,
                name: name.unwrap_or_else(|| format!("HTTP{status}")),
                message,
            },
        }
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::InvalidCredentials(_) => true,
            Error::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the server refused a delta-set request for this query.
    pub fn is_delta_set_unsupported(&self) -> bool {
        matches!(self, Error::Server { name, .. } if DELTA_SET_UNSUPPORTED.contains(&name.as_str()))
    }
}

impl From<docsync_engine::Error> for Error {
    fn from(err: docsync_engine::Error) -> Self {
        use docsync_engine::Error as Engine;
        match err {
            Engine::InvalidQuery(msg) => Error::InvalidQuery(msg),
            Engine::UnsupportedLocally(op) => Error::UnsupportedLocally(op),
            Engine::MissingIdentifier => Error::MissingIdentifier,
            Engine::CorruptDocument(msg) => Error::CorruptDocument(msg),
            Engine::Serialization(msg) => Error::Serialization(msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_without_name_is_invalid_credentials() {
        let err = Error::from_response(401, b"");
        assert!(matches!(err, Error::InvalidCredentials(_)));
    }

    #[test]
    fn insufficient_credentials_is_not_refreshable() {
        let body = br#"{"error": "InsufficientCredentials", "description": "no access"}"#;
        let err = Error::from_response(401, body);
        assert_eq!(
            err,
            Error::Server {
                status: 401,
                name: "InsufficientCredentials".into(),
                message: "no access".into(),
            }
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn not_found_and_server_errors() {
        let err = Error::from_response(404, br#"{"error": "EntityNotFound"}"#);
        assert!(matches!(err, Error::NotFound(_)));

        let err = Error::from_response(503, b"upstream down");
        assert_eq!(
            err,
            Error::Server {
                status: 503,
                name: "HTTP503".into(),
                message: "upstream down".into(),
            }
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn delta_set_unsupported_names() {
        let body = br#"{"error": "ParameterValueOutOfRange", "debug": "since too old"}"#;
        let err = Error::from_response(400, body);
        assert!(err.is_delta_set_unsupported());
        assert!(!Error::Network("down".into()).is_delta_set_unsupported());
    }

    #[test]
    fn timeouts_are_network_errors() {
        let err: Error = TransportError::Timeout.into();
        assert!(matches!(err, Error::Network(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn engine_errors_convert() {
        let err: Error = docsync_engine::Error::UnsupportedLocally("$text".into()).into();
        assert_eq!(err, Error::UnsupportedLocally("$text".into()));
    }
}
