//! Error types for collaboration scoring
//!
//! Retry-eligible errors (`ParseFailure`, `InvalidContent`,
//! `TransportFailure`) are absorbed by the retry controller and only surface
//! as an error marker on the returned record. Any other error from an
//! inference client ends the run after one attempt. Store and reconciler operations
//! return the remaining variants as typed errors.

use thiserror::Error;

/// Main error type for collabeval operations
#[derive(Error, Debug)]
pub enum CollabError {
    /// No JSON payload could be extracted from a model response
    #[error("Failed to parse model response: {excerpt}")]
    ParseFailure {
        /// First 500 characters of the raw response
        excerpt: String,
    },

    /// Payload parsed but failed the validity predicate
    #[error("Invalid analysis content: {0}")]
    InvalidContent(String),

    /// The inference call failed (timeout, connection, non-success status)
    #[error("Inference transport failure: {0}")]
    TransportFailure(String),

    /// Mapping write referenced an identity that is not registered
    #[error("Unknown registered identity: {identity}")]
    ReferentialIntegrity { identity: String },

    /// Reconciliation found no usable records
    #[error("No analysis records found for {0}")]
    NoRecordsFound(String),

    /// A single stored record could not be loaded
    #[error("Corrupt record {source_ref}: {reason}")]
    RecordCorrupt { source_ref: String, reason: String },

    /// Input rejected before reaching storage
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CollabError {
    /// Whether the retry controller may try again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollabError::ParseFailure { .. }
                | CollabError::InvalidContent(_)
                | CollabError::TransportFailure(_)
        )
    }
}

/// Result type alias for collabeval operations
pub type Result<T> = std::result::Result<T, CollabError>;

impl From<libsql::Error> for CollabError {
    fn from(err: libsql::Error) -> Self {
        CollabError::Database(err.to_string())
    }
}

impl From<config::ConfigError> for CollabError {
    fn from(err: config::ConfigError) -> Self {
        CollabError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for CollabError {
    fn from(err: toml::de::Error) -> Self {
        CollabError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CollabError::ReferentialIntegrity {
            identity: "mallory".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown registered identity: mallory");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CollabError::ParseFailure { excerpt: String::new() }.is_retryable());
        assert!(CollabError::InvalidContent("zeroed".into()).is_retryable());
        assert!(CollabError::TransportFailure("timeout".into()).is_retryable());
        assert!(!CollabError::NoRecordsFound("alice".into()).is_retryable());
        assert!(!CollabError::Database("locked".into()).is_retryable());
        assert!(!CollabError::Config("missing api key".into()).is_retryable());
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: CollabError = json_err.into();
        assert!(matches!(err, CollabError::Serialization(_)));
    }
}
