//! Error types for batchwise.
//!
//! Centralized error handling using thiserror. Only configuration problems
//! escape `Batch::run`/`Batch::listen`; per-call failures are absorbed by the
//! dispatcher and show up as missing result rows.

use thiserror::Error;

/// All error types that can occur in batchwise.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Engine misconfigured or started with nothing to do.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation name not present in the registry.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// A single call exceeded its deadline.
    #[error("Call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The remote service rejected or failed the call.
    #[error("Remote call failed{}: {message}", status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    RemoteCall { status: Option<u16>, message: String },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BatchError {
    /// Build a remote-call error with an HTTP status.
    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        BatchError::RemoteCall {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Whether this error surfaces to the caller of `run`/`listen`.
    pub fn is_configuration(&self) -> bool {
        matches!(self, BatchError::Configuration(_) | BatchError::UnknownOperation(_))
    }

    /// Malformed-request errors caused by an input that is too long for the model.
    pub fn is_context_overflow(&self) -> bool {
        match self {
            BatchError::RemoteCall {
                status: Some(400),
                message,
            } => {
                let message = message.to_lowercase();
                message.contains("context_length_exceeded")
                    || message.contains("maximum context length")
                    || message.contains("too many tokens")
            }
            _ => false,
        }
    }
}

/// Result type alias for batchwise operations.
pub type Result<T> = std::result::Result<T, BatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error() {
        let err = BatchError::Configuration("Engine cannot run without at least one job scheduled".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Engine cannot run without at least one job scheduled"
        );
        assert!(err.is_configuration());
    }

    #[test]
    fn test_unknown_operation_is_configuration() {
        let err = BatchError::UnknownOperation("images.generate".to_string());
        assert_eq!(err.to_string(), "Unknown operation: images.generate");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_timeout_error() {
        let err = BatchError::Timeout { secs: 60 };
        assert_eq!(err.to_string(), "Call timed out after 60s");
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_remote_call_error_with_status() {
        let err = BatchError::remote(429, "slow down");
        assert_eq!(err.to_string(), "Remote call failed (429): slow down");
    }

    #[test]
    fn test_remote_call_error_without_status() {
        let err = BatchError::RemoteCall {
            status: None,
            message: "connection reset".to_string(),
        };
        assert_eq!(err.to_string(), "Remote call failed: connection reset");
    }

    #[test]
    fn test_context_overflow_detection() {
        let err = BatchError::remote(
            400,
            r#"{"error":{"code":"context_length_exceeded","message":"too long"}}"#,
        );
        assert!(err.is_context_overflow());

        let err = BatchError::remote(400, "This model's maximum context length is 8192 tokens");
        assert!(err.is_context_overflow());

        assert!(!BatchError::remote(400, "invalid model").is_context_overflow());
        assert!(!BatchError::remote(500, "maximum context length").is_context_overflow());
        assert!(!BatchError::Timeout { secs: 60 }.is_context_overflow());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BatchError = io_err.into();
        assert!(matches!(err, BatchError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: BatchError = json_err.into();
        assert!(matches!(err, BatchError::Json(_)));
    }
}
