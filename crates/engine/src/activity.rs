//! Units of work a pipeline step can dispatch to.
//!
//! An [`Activity`] is a single side-effecting call with its own timeout and
//! retry policy. A [`ChildWorkflowTask`] expands into a nested pipeline run
//! that the orchestrator executes under a derived workflow id.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use runlane_types::{CleanupStepSpec, ValidationErrors, WorkflowDefinition};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::run::RunInfo;

/// Failure of one activity attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActivityError {
    #[error("{code}: {message}")]
    Application { code: String, message: String, retryable: bool },

    #[error("attempt timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("invalid input: {0}")]
    Validation(ValidationErrors),

    #[error("activity canceled")]
    Canceled,
}

impl ActivityError {
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Application {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Application {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Stable code matched against `RetryPolicy::non_retryable_errors`.
    pub fn code(&self) -> &str {
        match self {
            ActivityError::Application { code, .. } => code,
            ActivityError::Timeout { .. } => "TIMEOUT",
            ActivityError::Validation(_) => "VALIDATION",
            ActivityError::Canceled => "CANCELED",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ActivityError::Application { retryable, .. } => *retryable,
            ActivityError::Timeout { .. } => true,
            ActivityError::Validation(_) | ActivityError::Canceled => false,
        }
    }
}

impl From<ValidationErrors> for ActivityError {
    fn from(errors: ValidationErrors) -> Self {
        ActivityError::Validation(errors)
    }
}

/// Resolved inputs handed to a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActivityInput {
    pub step_id: String,
    pub payload: JsonMap<String, Value>,
    pub config: IndexMap<String, String>,
    pub run: RunInfo,
}

impl ActivityInput {
    /// Decode the payload into a task's request shape.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ActivityError> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|error| ActivityError::Validation(ValidationErrors::single("payload", error.to_string())))
    }

    /// A payload string, falling back to the config value of the same name.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.payload.get(key) {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Null) | None => self.config.get(key).cloned(),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// A single side-effecting unit of work.
#[async_trait]
pub trait Activity: Send + Sync {
    fn name(&self) -> &str;

    /// Rewrite the input before the first attempt.
    fn configure(&self, input: ActivityInput) -> Result<ActivityInput, ActivityError> {
        Ok(input)
    }

    /// Run one attempt. The runtime owns timeouts and retries.
    async fn execute(&self, input: &ActivityInput, cancel: &CancellationToken) -> Result<Value, ActivityError>;

    /// Compensating steps to append to the run's cleanup saga after success.
    fn compensation(&self, _input: &ActivityInput, _output: &Value) -> Vec<CleanupStepSpec> {
        Vec::new()
    }
}

/// A nested pipeline the orchestrator runs as a child.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildPlan {
    pub definition: WorkflowDefinition,
    pub config: IndexMap<String, String>,
    pub payload: JsonMap<String, Value>,
}

/// A task that expands into a child pipeline run.
pub trait ChildWorkflowTask: Send + Sync {
    fn name(&self) -> &str;

    fn plan(&self, input: &ActivityInput) -> Result<ChildPlan, ActivityError>;
}
