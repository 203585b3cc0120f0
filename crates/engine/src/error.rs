use std::time::Duration;

use runlane_types::ValidationErrors;
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;

use crate::{activity::ActivityError, resolve::ExpressionError};

/// Why a pipeline run did not succeed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline: {0}")]
    Invalid(ValidationErrors),

    #[error("step '{step_id}' uses unknown task '{uses}'")]
    UnknownTask { step_id: String, uses: String },

    #[error("step '{step_id}': {source}")]
    Expression {
        step_id: String,
        #[source]
        source: ExpressionError,
    },

    #[error("step '{step_id}' has invalid inputs: {errors}")]
    Input { step_id: String, errors: ValidationErrors },

    #[error("step '{step_id}' failed: {source}")]
    Step {
        step_id: String,
        #[source]
        source: ActivityError,
    },

    #[error("step '{step_id}' failed in a nested run: {source}")]
    Nested {
        step_id: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// Continue-on-error steps failed; the run finished but is reported failed.
    #[error("{count} step(s) failed: {}", summarize(.causes))]
    Failed {
        count: usize,
        causes: Vec<PipelineError>,
        /// Outputs of the steps that did produce one.
        outputs: JsonMap<String, Value>,
    },

    #[error("run exceeded its execution timeout of {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("run canceled")]
    Canceled,

    #[error("hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },
}

impl PipelineError {
    pub fn hook(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            hook: hook.into(),
            message: message.into(),
        }
    }

    /// Stable code reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Invalid(_) => "INVALID_PIPELINE",
            PipelineError::UnknownTask { .. } => "UNKNOWN_TASK",
            PipelineError::Expression { .. } => "EXPRESSION_ERROR",
            PipelineError::Input { .. } => "INVALID_INPUT",
            PipelineError::Step { .. } | PipelineError::Nested { .. } => "STEP_FAILED",
            PipelineError::Failed { .. } => "STEPS_FAILED",
            PipelineError::Timeout { .. } => "TIMEOUT",
            PipelineError::Canceled => "CANCELED",
            PipelineError::Hook { .. } => "HOOK_FAILED",
        }
    }

    /// Step id the failure is attributed to, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            PipelineError::UnknownTask { step_id, .. }
            | PipelineError::Expression { step_id, .. }
            | PipelineError::Input { step_id, .. }
            | PipelineError::Step { step_id, .. }
            | PipelineError::Nested { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// Partial outputs carried by an aggregated failure.
    pub fn partial_outputs(&self) -> Option<&JsonMap<String, Value>> {
        match self {
            PipelineError::Failed { outputs, .. } => Some(outputs),
            _ => None,
        }
    }
}

fn summarize(causes: &[PipelineError]) -> String {
    causes.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}
