//! Error types for the chat services.
//!
//! The relay answers every failure with the same plain-text 500, so the
//! variants only distinguish where a failure came from for logging.

use thiserror::Error;

/// Result type alias using the chat error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for chat services.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// External service error (inference server, image host)
    #[error("External service error: {0}")]
    External(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::External("connection refused".into()).to_string(),
            "External service error: connection refused"
        );
        assert_eq!(
            Error::InvalidInput("no model selected".into()).to_string(),
            "Invalid input: no model selected"
        );
    }

    #[test]
    fn test_json_error_converts() {
        fn parse(raw: &str) -> Result<serde_json::Value> {
            Ok(serde_json::from_str(raw)?)
        }
        let err = parse("{not json").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().starts_with("JSON error"));
    }
}
