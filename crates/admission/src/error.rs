//! Error types for admission control.

use thiserror::Error;

/// Errors returned by semaphore instances and the ticket coordinator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// A required request field is missing or malformed.
    #[error("Invalid admission request: {message}")]
    InvalidRequest { message: String },

    /// The runner queue is full. Surfaced unchanged so callers can say "try later".
    #[error("Queue limit exceeded on runner {runner_id}: {line_len} queued, limit {limit}")]
    QueueLimitExceeded { runner_id: String, line_len: usize, limit: usize },

    #[error("Semaphore already started: {instance_id}")]
    AlreadyStarted { instance_id: String },

    /// The instance is not running or its state could not be read or written.
    #[error("Semaphore unavailable: {instance_id} - {reason}")]
    Unavailable { instance_id: String, reason: String },

    /// Any other failure while admitting a ticket.
    #[error("Admission failed: {message}")]
    Execution { message: String },
}

impl AdmissionError {
    pub fn invalid(message: impl Into<String>) -> Self {
        AdmissionError::InvalidRequest { message: message.into() }
    }

    pub fn unavailable(instance_id: impl Into<String>, reason: impl Into<String>) -> Self {
        AdmissionError::Unavailable {
            instance_id: instance_id.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        AdmissionError::Execution { message: message.into() }
    }

    /// Stable code for callers that only see the serialized error.
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::InvalidRequest { .. } => "INVALID_REQUEST",
            AdmissionError::QueueLimitExceeded { .. } => "QUEUE_LIMIT_EXCEEDED",
            AdmissionError::AlreadyStarted { .. } => "ALREADY_STARTED",
            AdmissionError::Unavailable { .. } => "UNAVAILABLE",
            AdmissionError::Execution { .. } => "EXECUTION_ERROR",
        }
    }

    /// Validation and queue-limit errors must never be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdmissionError::Unavailable { .. } | AdmissionError::Execution { .. })
    }
}
