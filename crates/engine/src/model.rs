//! # Pipeline Loading
//!
//! Pipelines are authored as YAML (JSON documents are valid YAML) and parsed
//! straight into [`WorkflowDefinition`]. Parsing never stops at the first
//! problem: structural checks from [`validate_definition`] are combined with
//! the engine's own rules and returned together as [`ValidationErrors`].

use std::{fs, path::Path};

use anyhow::{Context, Result};
use runlane_types::{ActivityOptions, StepDefinition, ValidationErrors, WorkflowDefinition, workflow::validate_definition};

/// Top-level run-context keys that step ids may not shadow.
pub const RESERVED_CONTEXT_KEYS: [&str; 4] = ["config", "payload", "run", "inputs"];

/// Parse and validate a pipeline document.
pub fn parse_pipeline(source: &str) -> Result<WorkflowDefinition, ValidationErrors> {
    if source.trim().is_empty() {
        return Err(ValidationErrors::single("document", "pipeline source is empty"));
    }
    let definition: WorkflowDefinition =
        serde_yaml::from_str(source).map_err(|error| ValidationErrors::single("document", error.to_string()))?;

    let mut errors = match validate_definition(&definition) {
        Ok(()) => ValidationErrors::new(),
        Err(errors) => errors,
    };
    check_engine_rules("steps", &definition.steps, &mut errors);
    for (name, block) in &definition.custom_checks {
        check_engine_rules(&format!("custom_checks.{name}.steps"), &block.steps, &mut errors);
    }
    if let Some(retry) = &definition.runtime.retry
        && retry.backoff_coefficient < 1.0
    {
        errors.push("runtime.retry.backoff_coefficient", "must be at least 1.0");
    }
    errors.into_result(definition)
}

/// Read, parse, and validate a pipeline file.
pub fn load_pipeline_file(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).with_context(|| format!("failed to read pipeline file {}", path.display()))?;
    parse_pipeline(&source).with_context(|| format!("invalid pipeline {}", path.display()))
}

fn check_engine_rules(prefix: &str, steps: &[StepDefinition], errors: &mut ValidationErrors) {
    for (index, step) in steps.iter().enumerate() {
        let field = format!("{prefix}[{index}]");
        if RESERVED_CONTEXT_KEYS.contains(&step.id.trim()) {
            errors.push(format!("{field}.id"), format!("'{}' is reserved for the run context", step.id));
        }
        if let Some(options) = &step.activity_options {
            check_options(&format!("{field}.activity_options"), options, errors);
        }
    }
}

fn check_options(field: &str, options: &ActivityOptions, errors: &mut ValidationErrors) {
    if options.start_to_close_timeout.is_some_and(|timeout| timeout.is_zero()) {
        errors.push(format!("{field}.start_to_close_timeout"), "must be greater than zero");
    }
    if options.schedule_to_close_timeout.is_some_and(|timeout| timeout.is_zero()) {
        errors.push(format!("{field}.schedule_to_close_timeout"), "must be greater than zero");
    }
    if let Some(retry) = &options.retry
        && retry.backoff_coefficient < 1.0
    {
        errors.push(format!("{field}.retry.backoff_coefficient"), "must be at least 1.0");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn parses_valid_pipeline() {
        let definition = parse_pipeline(
            r#"
name: checkout
runtime:
  execution_timeout: 10m
steps:
  - id: greet
    use: core/echo
    with:
      payload:
        message: hi
"#,
        )
        .expect("valid");
        assert_eq!(definition.name, "checkout");
        assert_eq!(definition.runtime.execution_timeout, Some(Duration::from_secs(600)));
        assert_eq!(definition.steps.len(), 1);
    }

    #[test]
    fn accepts_json_documents() {
        let definition = parse_pipeline(r#"{"name": "j", "steps": [{"id": "a", "use": "core/echo"}]}"#).expect("json");
        assert_eq!(definition.steps[0].uses, "core/echo");
    }

    #[test]
    fn reports_all_problems_together() {
        let errors = parse_pipeline(
            r#"
name: broken
steps:
  - id: config
    use: core/echo
  - id: wait
    use: ""
    activity_options:
      start_to_close_timeout: 0s
"#,
        )
        .expect_err("invalid");
        let fields: Vec<&str> = errors.errors.iter().map(|error| error.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["steps[1].use", "steps[0].id", "steps[1].activity_options.start_to_close_timeout"]
        );
    }

    #[test]
    fn bad_duration_is_a_document_error() {
        let errors = parse_pipeline("name: x\nruntime:\n  execution_timeout: soon\nsteps: []\n").expect_err("invalid");
        assert_eq!(errors.errors[0].field, "document");
    }

    #[test]
    fn loads_from_file_with_context() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pipeline.yaml");
        fs::write(&path, "name: ''\nsteps: []\n").expect("write");

        let error = load_pipeline_file(&path).expect_err("invalid");
        let rendered = format!("{error:#}");
        assert!(rendered.contains("invalid pipeline"), "{rendered}");
        assert!(rendered.contains("name: must not be empty"), "{rendered}");
    }
}
