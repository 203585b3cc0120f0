//! Step input resolution.
//!
//! Before a step is dispatched its config is merged over the pipeline's
//! (the step wins), then every `${{ }}` reference in its config and payload
//! is resolved against the run context and typed payload entries are coerced
//! to their declared kind.

use indexmap::IndexMap;
use runlane_types::{PayloadKind, PayloadValue, StepDefinition, ValidationErrors};
use serde_json::{Map as JsonMap, Number, Value};

use crate::{
    error::PipelineError,
    resolve::{ExpressionError, exact_reference, resolve_reference, resolve_string, resolve_value, stringify},
};

/// A step's inputs after merging and resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedInputs {
    pub config: IndexMap<String, String>,
    pub payload: JsonMap<String, Value>,
}

/// `base` with every key of `overlay` written on top.
pub fn merge_config(base: &IndexMap<String, String>, overlay: &IndexMap<String, String>) -> IndexMap<String, String> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Merge and resolve the inputs of `step`.
///
/// Payload keys listed in `verbatim_keys` are passed through untouched unless
/// their value is exactly one reference.
pub fn resolve_step_inputs(
    step: &StepDefinition,
    pipeline_config: &IndexMap<String, String>,
    context: &Value,
    verbatim_keys: &[String],
) -> Result<ResolvedInputs, PipelineError> {
    let expression_error = |source: ExpressionError| PipelineError::Expression {
        step_id: step.id.clone(),
        source,
    };

    let mut config = IndexMap::new();
    for (key, raw) in merge_config(pipeline_config, &step.with.config) {
        let resolved = resolve_string(&raw, context).map_err(expression_error)?;
        config.insert(key, stringify(&resolved));
    }

    let mut payload = JsonMap::new();
    let mut errors = ValidationErrors::new();
    for (key, entry) in &step.with.payload {
        let resolved = match entry {
            PayloadValue::Typed(typed) if typed.kind == PayloadKind::Ref => resolve_ref_entry(&typed.value, context),
            _ if verbatim_keys.iter().any(|verbatim| verbatim == key) => resolve_exact_only(entry.raw(), context),
            _ => resolve_value(entry.raw(), context),
        }
        .map_err(expression_error)?;

        match entry.kind() {
            Some(kind) => match coerce_payload(kind, resolved) {
                Ok(value) => {
                    payload.insert(key.clone(), value);
                }
                Err(message) => errors.push(format!("with.payload.{key}"), message),
            },
            None => {
                payload.insert(key.clone(), resolved);
            }
        }
    }

    if !errors.is_empty() {
        return Err(PipelineError::Input {
            step_id: step.id.clone(),
            errors,
        });
    }
    Ok(ResolvedInputs { config, payload })
}

fn resolve_exact_only(value: &Value, context: &Value) -> Result<Value, ExpressionError> {
    match value {
        Value::String(text) => match exact_reference(text) {
            Some(reference) => resolve_reference(reference, context),
            None => Ok(value.clone()),
        },
        other => Ok(other.clone()),
    }
}

/// `ref` entries hold a bare path; a wrapped `${{ }}` path is accepted too.
fn resolve_ref_entry(value: &Value, context: &Value) -> Result<Value, ExpressionError> {
    match value {
        Value::String(text) => resolve_reference(exact_reference(text).unwrap_or(text), context),
        other => Err(ExpressionError::Syntax {
            reference: other.to_string(),
            reason: "a ref entry must be a string path".into(),
        }),
    }
}

/// Apply the declared type of a typed payload entry.
pub fn coerce_payload(kind: PayloadKind, value: Value) -> Result<Value, String> {
    let mismatch = |value: &Value| format!("cannot convert {value} to {}", kind.as_str());
    match kind {
        PayloadKind::Ref => Ok(value),
        PayloadKind::String => Ok(Value::String(stringify(&value))),
        PayloadKind::Number => match &value {
            Value::Number(_) => Ok(value),
            Value::String(text) => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| mismatch(&value)),
            _ => Err(mismatch(&value)),
        },
        PayloadKind::Integer => match &value {
            Value::Number(number) if number.is_i64() || number.is_u64() => Ok(value),
            Value::Number(number) => number
                .as_f64()
                .filter(|float| float.fract() == 0.0 && float.abs() < i64::MAX as f64)
                .map(|float| Value::from(float as i64))
                .ok_or_else(|| mismatch(&value)),
            Value::String(text) => text.trim().parse::<i64>().map(Value::from).map_err(|_| mismatch(&value)),
            _ => Err(mismatch(&value)),
        },
        PayloadKind::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch(&value)),
            },
            _ => Err(mismatch(&value)),
        },
        PayloadKind::Map => match value {
            Value::Object(_) => Ok(value),
            Value::String(ref text) => match serde_json::from_str::<Value>(text) {
                Ok(parsed @ Value::Object(_)) => Ok(parsed),
                _ => Err(mismatch(&value)),
            },
            _ => Err(mismatch(&value)),
        },
        PayloadKind::List => match value {
            Value::Array(_) => Ok(value),
            Value::String(ref text) => match serde_json::from_str::<Value>(text) {
                Ok(parsed @ Value::Array(_)) => Ok(parsed),
                _ => Err(mismatch(&value)),
            },
            _ => Err(mismatch(&value)),
        },
        PayloadKind::Json => match &value {
            Value::String(text) => serde_json::from_str(text).map_err(|error| format!("invalid JSON: {error}")),
            _ => Ok(value),
        },
    }
}

#[cfg(test)]
mod tests {
    use runlane_types::{StepInputs, TypedPayload};
    use serde_json::json;

    use super::*;

    fn context() -> Value {
        json!({
            "login": {"outputs": {"token": "t-1", "retries": "4", "user": {"id": 7}}},
            "config": {"region": "eu"}
        })
    }

    fn typed(kind: PayloadKind, value: Value) -> PayloadValue {
        PayloadValue::Typed(TypedPayload { kind, value })
    }

    fn step(config: &[(&str, &str)], payload: Vec<(&str, PayloadValue)>) -> StepDefinition {
        StepDefinition {
            id: "call".into(),
            uses: "core/echo".into(),
            with: StepInputs {
                config: config.iter().map(|(key, value)| (key.to_string(), value.to_string())).collect(),
                payload: payload.into_iter().map(|(key, value)| (key.to_string(), value)).collect(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn step_config_wins_over_pipeline_config() {
        let pipeline: IndexMap<String, String> = [("region".to_string(), "us".to_string()), ("tier".to_string(), "gold".to_string())]
            .into_iter()
            .collect();
        let definition = step(&[("region", "${{ config.region }}-west")], Vec::new());
        let resolved = resolve_step_inputs(&definition, &pipeline, &context(), &[]).expect("resolve");
        assert_eq!(resolved.config["region"], "eu-west");
        assert_eq!(resolved.config["tier"], "gold");
    }

    #[test]
    fn payload_keeps_native_types_for_exact_references() {
        let definition = step(
            &[],
            vec![
                ("user", json!("${{ login.outputs.user }}").into()),
                ("header", json!("Bearer ${{ login.outputs.token }}").into()),
            ],
        );
        let resolved = resolve_step_inputs(&definition, &IndexMap::new(), &context(), &[]).expect("resolve");
        assert_eq!(resolved.payload["user"], json!({"id": 7}));
        assert_eq!(resolved.payload["header"], json!("Bearer t-1"));
    }

    #[test]
    fn verbatim_keys_skip_interpolation_but_not_exact_references() {
        let definition = step(
            &[],
            vec![
                ("template", json!("Hi {{ name }} ${{ login.outputs.token }}").into()),
                ("vars", json!("${{ login.outputs.user }}").into()),
            ],
        );
        let verbatim = vec!["template".to_string(), "vars".to_string()];
        let resolved = resolve_step_inputs(&definition, &IndexMap::new(), &context(), &verbatim).expect("resolve");
        assert_eq!(resolved.payload["template"], json!("Hi {{ name }} ${{ login.outputs.token }}"));
        assert_eq!(resolved.payload["vars"], json!({"id": 7}));
    }

    #[test]
    fn typed_entries_are_coerced_after_resolution() {
        let definition = step(
            &[],
            vec![
                ("retries", typed(PayloadKind::Integer, json!("${{ login.outputs.retries }}"))),
                ("user", typed(PayloadKind::Ref, json!("login.outputs.user.id"))),
                ("body", typed(PayloadKind::Json, json!("{\"a\": [1, 2]}"))),
                ("enabled", typed(PayloadKind::Boolean, json!("TRUE"))),
                ("label", typed(PayloadKind::String, json!(12))),
            ],
        );
        let resolved = resolve_step_inputs(&definition, &IndexMap::new(), &context(), &[]).expect("resolve");
        assert_eq!(resolved.payload["retries"], json!(4));
        assert_eq!(resolved.payload["user"], json!(7));
        assert_eq!(resolved.payload["body"], json!({"a": [1, 2]}));
        assert_eq!(resolved.payload["enabled"], json!(true));
        assert_eq!(resolved.payload["label"], json!("12"));
    }

    #[test]
    fn coercion_failures_are_collected_per_field() {
        let definition = step(
            &[],
            vec![
                ("count", typed(PayloadKind::Integer, json!("many"))),
                ("items", typed(PayloadKind::List, json!({"a": 1}))),
            ],
        );
        let error = resolve_step_inputs(&definition, &IndexMap::new(), &context(), &[]).expect_err("invalid");
        let PipelineError::Input { step_id, errors } = error else {
            panic!("unexpected error: {error}");
        };
        assert_eq!(step_id, "call");
        let fields: Vec<&str> = errors.errors.iter().map(|error| error.field.as_str()).collect();
        assert_eq!(fields, vec!["with.payload.count", "with.payload.items"]);
    }

    #[test]
    fn unresolvable_exact_reference_is_a_hard_error() {
        let definition = step(&[], vec![("missing", json!("${{ login.outputs.nope }}").into())]);
        let error = resolve_step_inputs(&definition, &IndexMap::new(), &context(), &[]).expect_err("missing");
        assert!(matches!(error, PipelineError::Expression { .. }), "{error}");
    }

    #[test]
    fn integer_accepts_whole_floats() {
        assert_eq!(coerce_payload(PayloadKind::Integer, json!(3.0)), Ok(json!(3)));
        assert!(coerce_payload(PayloadKind::Integer, json!(3.5)).is_err());
        assert_eq!(coerce_payload(PayloadKind::Number, json!("2.5")), Ok(json!(2.5)));
    }
}
