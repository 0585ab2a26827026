//! Error reporting
//!
//! [`ErrorResponse`] is the JSON shape binaries print when a command fails.

use psdforge_core::AppError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub recoverable: bool,
}

impl From<&AppError> for ErrorResponse {
    fn from(err: &AppError) -> Self {
        let details = match err {
            AppError::InternalWithSource { source, .. } => Some(format!("{:#}", source)),
            _ => None,
        };
        Self {
            error: err.to_string(),
            details,
            error_type: Some(err.kind().to_string()),
            recoverable: err.is_recoverable(),
        }
    }
}

impl From<&anyhow::Error> for ErrorResponse {
    fn from(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<AppError>() {
            Some(app) => Self::from(app),
            None => {
                let chain: Vec<String> = err.chain().skip(1).map(|e| e.to_string()).collect();
                Self {
                    error: err.to_string(),
                    details: (!chain.is_empty()).then(|| chain.join(": ")),
                    error_type: None,
                    recoverable: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_app_error_response() {
        let response = ErrorResponse::from(&AppError::QueueFull { capacity: 3 });
        assert_eq!(response.error_type.as_deref(), Some("queue_full"));
        assert!(response.recoverable);

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("details").is_none());
    }

    #[test]
    fn test_anyhow_error_keeps_context_chain() {
        let err = Err::<(), _>(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
            .context("Read input")
            .unwrap_err();
        let response = ErrorResponse::from(&err);
        assert_eq!(response.error, "Read input");
        assert_eq!(response.details.as_deref(), Some("gone"));
        assert!(response.error_type.is_none());
    }

    #[test]
    fn test_anyhow_wrapping_app_error_is_typed() {
        let err = anyhow::Error::new(AppError::NotFound("job_x".into()));
        let response = ErrorResponse::from(&err);
        assert_eq!(response.error_type.as_deref(), Some("not_found"));
    }
}
