//! Error types for cleanup execution and failed-cleanup persistence.

use std::time::Duration;

use thiserror::Error;

/// A single cleanup attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CleanupError {
    #[error("No cleanup action registered for step type '{step_type}'")]
    UnknownStepType { step_type: String },

    #[error("Cleanup payload for '{step}' is invalid: {reason}")]
    InvalidPayload { step: String, reason: String },

    #[error("Cleanup step '{step}' failed: {message}")]
    Action { step: String, message: String },

    #[error("Cleanup step '{step}' timed out after {}ms", timeout.as_millis())]
    Timeout { step: String, timeout: Duration },

    #[error("Cleanup canceled before '{step}' ran")]
    Canceled { step: String },
}

impl CleanupError {
    pub fn action(step: impl Into<String>, message: impl Into<String>) -> Self {
        CleanupError::Action {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn invalid_payload(step: impl Into<String>, reason: impl Into<String>) -> Self {
        CleanupError::InvalidPayload {
            step: step.into(),
            reason: reason.into(),
        }
    }
}

/// Reading or writing failed-cleanup records failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed-cleanup record not found: {id}")]
    NotFound { id: String },

    #[error("Failed-cleanup store error: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend { message: message.into() }
    }
}

impl From<runlane_api::ApiError> for StoreError {
    fn from(error: runlane_api::ApiError) -> Self {
        match error {
            runlane_api::ApiError::NotFound { what } => StoreError::NotFound { id: what },
            other => StoreError::backend(other.to_string()),
        }
    }
}
