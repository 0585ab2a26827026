//! Error types module
//!
//! Every failure that crosses a crate boundary in psdforge is expressed as an
//! [`AppError`]. Internal plumbing uses `anyhow` with context and converts at
//! the edge.

use std::io;

/// Log level an error should be reported at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Expected failures such as bad input
    Debug,
    /// Recoverable conditions such as backpressure
    Warn,
    /// Unexpected failures
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    #[error("Composite failure: {0}")]
    CompositeFailure(String),

    #[error("Encode failure: {0}")]
    EncodeFailure(String),

    #[error("Hash failure: {0}")]
    HashFailure(String),

    #[error("Queue is full ({capacity} jobs waiting), please try again later")]
    QueueFull { capacity: usize },

    #[error("Job exceeded the configured timeout of {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error: {message}")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Keep typed errors that were wrapped in anyhow on the way up.
        match err.downcast::<AppError>() {
            Ok(app) => app,
            Err(err) => AppError::InternalWithSource {
                message: err.to_string(),
                source: err,
            },
        }
    }
}

impl AppError {
    /// Stable machine-readable code, used in job results and CLI output
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::DecodeFailure(_) => "decode_failure",
            AppError::CompositeFailure(_) => "composite_failure",
            AppError::EncodeFailure(_) => "encode_failure",
            AppError::HashFailure(_) => "hash_failure",
            AppError::QueueFull { .. } => "queue_full",
            AppError::Timeout { .. } => "timeout",
            AppError::StorageFailure(_) => "storage_failure",
            AppError::NotFound(_) => "not_found",
            AppError::Cancelled(_) => "cancelled",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
            AppError::Internal(_) | AppError::InternalWithSource { .. } => "internal",
        }
    }

    /// Whether retrying the same request later can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::QueueFull { .. } | AppError::Timeout { .. } | AppError::StorageFailure(_)
        )
    }

    pub fn log_level(&self) -> LogLevel {
        match self {
            AppError::InvalidInput(_) | AppError::NotFound(_) | AppError::Cancelled(_) => {
                LogLevel::Debug
            }
            AppError::QueueFull { .. }
            | AppError::Timeout { .. }
            | AppError::HashFailure(_)
            | AppError::CompositeFailure(_) => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }

    /// Rebuild a typed error from a `kind()` code and message, e.g. when a
    /// result crossed a process boundary as JSON.
    pub fn from_kind(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "invalid_input" => AppError::InvalidInput(message),
            "decode_failure" => AppError::DecodeFailure(message),
            "composite_failure" => AppError::CompositeFailure(message),
            "encode_failure" => AppError::EncodeFailure(message),
            "hash_failure" => AppError::HashFailure(message),
            "storage_failure" => AppError::StorageFailure(message),
            "not_found" => AppError::NotFound(message),
            "cancelled" => AppError::Cancelled(message),
            _ => AppError::Internal(message),
        }
    }

    /// Error message including the source chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();
        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(AppError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(AppError::QueueFull { capacity: 3 }.kind(), "queue_full");
        assert_eq!(AppError::Timeout { seconds: 1 }.kind(), "timeout");
        assert_eq!(AppError::Internal("x".into()).kind(), "internal");
    }

    #[test]
    fn test_from_kind_round_trips_typed_variants() {
        let err = AppError::from_kind("decode_failure", "bad signature");
        assert!(matches!(err, AppError::DecodeFailure(ref m) if m == "bad signature"));

        let err = AppError::from_kind("something_new", "msg");
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(AppError::QueueFull { capacity: 1 }.is_recoverable());
        assert!(AppError::StorageFailure("down".into()).is_recoverable());
        assert!(!AppError::InvalidInput("bad".into()).is_recoverable());
        assert!(!AppError::EncodeFailure("none".into()).is_recoverable());
    }

    #[test]
    fn test_anyhow_keeps_typed_error() {
        let wrapped = anyhow::Error::new(AppError::HashFailure("unreadable".into()));
        let app: AppError = wrapped.into();
        assert!(matches!(app, AppError::HashFailure(_)));

        let plain: AppError = anyhow::anyhow!("boom").into();
        assert_eq!(plain.kind(), "internal");
    }

    #[test]
    fn test_detailed_message_includes_source() {
        let err = AppError::InternalWithSource {
            message: "outer".into(),
            source: anyhow::anyhow!("inner cause"),
        };
        let details = err.detailed_message();
        assert!(details.contains("outer"));
        assert!(details.contains("inner cause"));
    }
}
