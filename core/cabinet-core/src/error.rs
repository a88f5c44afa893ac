//! Error types for cabinet-core operations.
//! Variant codes are part of the wire contract; keep them stable.

use cabinet_protocol::ErrorInfo;
use serde::Serialize;

/// Structured detail attached to a short return that is missing its
/// justification, so the caller can re-prompt and retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReturnShortfall {
    pub requires_justification: bool,
    pub expected_samples: u32,
    pub returned_samples: u32,
}

/// All errors a lifecycle operation can surface.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    // ─────────────────────────────────────────────────────────────────────
    // Terminal for the request
    // ─────────────────────────────────────────────────────────────────────
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{message}")]
    Validation {
        message: String,
        shortfall: Option<ReturnShortfall>,
    },

    #[error("{0}")]
    Forbidden(String),

    // ─────────────────────────────────────────────────────────────────────
    // Retryable
    // ─────────────────────────────────────────────────────────────────────
    #[error("storage unavailable: {0}")]
    Transient(String),
}

/// Convenience type alias for Results using LifecycleError.
pub type Result<T> = std::result::Result<T, LifecycleError>;

impl LifecycleError {
    pub fn validation(message: impl Into<String>) -> Self {
        LifecycleError::Validation {
            message: message.into(),
            shortfall: None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::NotFound(_) => "not_found",
            LifecycleError::Conflict(_) => "conflict",
            LifecycleError::InvalidState(_) => "invalid_state",
            LifecycleError::Validation { .. } => "validation",
            LifecycleError::Forbidden(_) => "forbidden",
            LifecycleError::Transient(_) => "transient",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, LifecycleError::Transient(_))
    }
}

impl From<LifecycleError> for ErrorInfo {
    fn from(err: LifecycleError) -> Self {
        let info = ErrorInfo::new(err.code(), err.to_string());
        match err {
            LifecycleError::Validation {
                shortfall: Some(shortfall),
                ..
            } => match serde_json::to_value(shortfall) {
                Ok(details) => info.with_details(details),
                Err(_) => info,
            },
            LifecycleError::Transient(_) => {
                info.with_details(serde_json::json!({ "retryable": true }))
            }
            _ => info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortfall_details_travel_with_validation_errors() {
        let err = LifecycleError::Validation {
            message: "Justification is required".to_string(),
            shortfall: Some(ReturnShortfall {
                requires_justification: true,
                expected_samples: 5,
                returned_samples: 3,
            }),
        };
        let info = ErrorInfo::from(err);
        assert_eq!(info.code, "validation");
        let details = info.details.expect("details");
        assert_eq!(details["requires_justification"], true);
        assert_eq!(details["expected_samples"], 5);
        assert_eq!(details["returned_samples"], 3);
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(LifecycleError::Transient("db locked".into()).retryable());
        assert!(!LifecycleError::Conflict("taken".into()).retryable());
        assert!(!LifecycleError::validation("bad").retryable());
    }
}
