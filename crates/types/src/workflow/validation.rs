//! Structural validation of pipeline definitions.
//!
//! Runs after deserialization and reports every problem it finds as a
//! field-level error so authors can fix a document in one pass.

use std::collections::HashSet;

use super::{StepDefinition, WorkflowDefinition};
use crate::ValidationErrors;

/// Maximum nesting of custom checks calling other custom checks.
pub const MAX_CUSTOM_CHECK_DEPTH: usize = 8;

/// Validate a parsed pipeline.
///
/// Checks:
/// - the pipeline has a name and at least one step;
/// - step ids are non-empty and unique within each step list;
/// - every step names a task through `use`;
/// - custom checks do not nest deeper than [`MAX_CUSTOM_CHECK_DEPTH`] (which
///   also rejects self-recursive checks);
/// - runner references are not blank.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();

    errors.require_non_empty("name", &definition.name);
    if definition.steps.is_empty() {
        errors.push("steps", "pipeline must declare at least one step");
    }
    validate_step_list("steps", &definition.steps, &mut errors);

    for (name, block) in &definition.custom_checks {
        let prefix = format!("custom_checks.{name}");
        if block.steps.is_empty() {
            errors.push(format!("{prefix}.steps"), "custom check must declare at least one step");
        }
        validate_step_list(&format!("{prefix}.steps"), &block.steps, &mut errors);
        for (index, input) in block.inputs.iter().enumerate() {
            if input.trim().is_empty() {
                errors.push(format!("{prefix}.inputs[{index}]"), "must not be empty");
            }
        }
        if custom_check_depth(definition, name, 0) > MAX_CUSTOM_CHECK_DEPTH {
            errors.push(
                prefix,
                format!("custom checks nest deeper than {MAX_CUSTOM_CHECK_DEPTH} levels (is the check recursive?)"),
            );
        }
    }

    for (index, runner) in definition.runners.iter().enumerate() {
        if runner.trim().is_empty() {
            errors.push(format!("runners[{index}]"), "must not be empty");
        }
    }

    errors.into_result(())
}

fn validate_step_list(prefix: &str, steps: &[StepDefinition], errors: &mut ValidationErrors) {
    let mut seen = HashSet::new();
    for (index, step) in steps.iter().enumerate() {
        let field = format!("{prefix}[{index}]");
        if step.id.trim().is_empty() {
            errors.push(format!("{field}.id"), "must not be empty");
        } else if !seen.insert(step.id.as_str()) {
            errors.push(format!("{field}.id"), format!("duplicate step identifier '{}'", step.id));
        }
        if step.uses.trim().is_empty() {
            errors.push(format!("{field}.use"), "must name a task or custom check");
        }
    }
}

fn custom_check_depth(definition: &WorkflowDefinition, name: &str, depth: usize) -> usize {
    if depth > MAX_CUSTOM_CHECK_DEPTH {
        return depth;
    }
    let Some(block) = definition.custom_checks.get(name) else {
        return depth;
    };
    block
        .steps
        .iter()
        .filter(|step| definition.custom_checks.contains_key(&step.uses))
        .map(|step| custom_check_depth(definition, &step.uses, depth + 1))
        .max()
        .unwrap_or(depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkflowBlock;

    fn step(id: &str, uses: &str) -> StepDefinition {
        StepDefinition {
            id: id.into(),
            uses: uses.into(),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_minimal_pipeline() {
        let definition = WorkflowDefinition {
            name: "demo".into(),
            steps: vec![step("a", "core/echo")],
            ..Default::default()
        };
        assert!(validate_definition(&definition).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let definition = WorkflowDefinition {
            name: " ".into(),
            steps: vec![step("a", "core/echo"), step("a", ""), step("", "core/echo")],
            runners: vec!["".into()],
            ..Default::default()
        };
        let errors = validate_definition(&definition).expect_err("invalid");
        let fields: Vec<&str> = errors.errors.iter().map(|error| error.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "steps[1].id", "steps[1].use", "steps[2].id", "runners[0]"]);
    }

    #[test]
    fn rejects_recursive_custom_check() {
        let mut definition = WorkflowDefinition {
            name: "loop".into(),
            steps: vec![step("start", "looping")],
            ..Default::default()
        };
        definition.custom_checks.insert(
            "looping".into(),
            WorkflowBlock {
                steps: vec![step("again", "looping")],
                ..Default::default()
            },
        );

        let errors = validate_definition(&definition).expect_err("recursive");
        assert!(errors.to_string().contains("nest deeper"), "unexpected: {errors}");
    }
}
