//! `pipeline/run`: runs an inline pipeline as a child of the current run.

use indexmap::IndexMap;
use runlane_types::ValidationErrors;
use serde_json::{Map as JsonMap, Value};

use crate::{
    activity::{ActivityError, ActivityInput, ChildPlan, ChildWorkflowTask},
    model::parse_pipeline,
    resolve::stringify,
};

/// Payload key holding the child pipeline document; passed through verbatim.
pub const SOURCE_KEY: &str = "source";

/// Parses the `source` payload key and hands the child to the orchestrator.
///
/// `config` (string map) and `payload` (map) payload keys become the child's
/// run inputs.
pub struct PipelineRunTask;

impl ChildWorkflowTask for PipelineRunTask {
    fn name(&self) -> &str {
        "pipeline/run"
    }

    fn plan(&self, input: &ActivityInput) -> Result<ChildPlan, ActivityError> {
        let source = match input.payload.get(SOURCE_KEY) {
            Some(Value::String(source)) => source,
            _ => return Err(ValidationErrors::single(SOURCE_KEY, "must be a pipeline document string").into()),
        };
        let definition = parse_pipeline(source).map_err(|errors| {
            let mut prefixed = ValidationErrors::new();
            prefixed.extend_prefixed(SOURCE_KEY, errors);
            ActivityError::Validation(prefixed)
        })?;

        let config: IndexMap<String, String> = match input.payload.get("config") {
            Some(Value::Object(map)) => map.iter().map(|(key, value)| (key.clone(), stringify(value))).collect(),
            Some(Value::Null) | None => IndexMap::new(),
            Some(_) => return Err(ValidationErrors::single("config", "must be a map").into()),
        };
        let payload: JsonMap<String, Value> = match input.payload.get("payload") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => JsonMap::new(),
            Some(_) => return Err(ValidationErrors::single("payload", "must be a map").into()),
        };

        Ok(ChildPlan {
            definition,
            config,
            payload,
        })
    }
}
