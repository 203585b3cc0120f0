//! Declarative pipeline schema.
//!
//! A pipeline document is authored in YAML (JSON documents are accepted as
//! well) and deserialized straight into [`WorkflowDefinition`]. Maps use
//! `IndexMap` so authoring order survives round trips and error messages list
//! keys in the order the author wrote them.

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub mod validation;

pub use validation::{MAX_CUSTOM_CHECK_DEPTH, validate_definition};

/// A parsed pipeline. Immutable once parsed; setup hooks work on a copy of the step list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkflowDefinition {
    /// Pipeline name, also used as the pipeline identifier when none is supplied.
    #[serde(default)]
    pub name: String,
    /// Namespace, queue, execution timeout, and retry defaults.
    #[serde(default)]
    pub runtime: RuntimePolicy,
    /// Pipeline-wide configuration merged underneath every step's own config.
    #[serde(default, deserialize_with = "deserialize_string_map")]
    pub config: IndexMap<String, String>,
    /// Named reusable blocks that steps can invoke by name through `use`.
    #[serde(default)]
    pub custom_checks: IndexMap<String, WorkflowBlock>,
    /// Mobile runners this pipeline needs exclusive access to (`owner/runner-name` or ids).
    #[serde(default)]
    pub runners: Vec<String>,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// True when running this pipeline requires admission through the runner queue.
    pub fn requires_runners(&self) -> bool {
        self.runners.iter().any(|runner| !runner.trim().is_empty())
    }

    /// The top-level step list viewed as a block without declared inputs or outputs.
    pub fn root_block(&self) -> WorkflowBlock {
        WorkflowBlock {
            inputs: Vec::new(),
            steps: self.steps.clone(),
            outputs: IndexMap::new(),
        }
    }
}

/// Where and how a pipeline run executes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RuntimePolicy {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    /// Upper bound on the whole run, cleanup hooks excluded.
    #[serde(default, with = "runlane_util::duration::serde::option")]
    pub execution_timeout: Option<Duration>,
    /// Pipeline-level retry defaults for every activity step.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; `0` means unlimited.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval", with = "runlane_util::duration::serde")]
    pub initial_interval: Duration,
    #[serde(default = "default_maximum_interval", with = "runlane_util::duration::serde")]
    pub maximum_interval: Duration,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,
    /// Error codes that stop retrying immediately.
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_maximum_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval: default_initial_interval(),
            maximum_interval: default_maximum_interval(),
            backoff_coefficient: default_backoff_coefficient(),
            non_retryable_errors: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based) just failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let coefficient = if self.backoff_coefficient >= 1.0 {
            self.backoff_coefficient
        } else {
            default_backoff_coefficient()
        };
        let seconds = self.initial_interval.as_secs_f64() * coefficient.powi(exponent);
        let capped = seconds.min(self.maximum_interval.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.maximum_interval
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn allows_attempt_after(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

/// Per-activity timeout and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ActivityOptions {
    /// Limit on a single attempt.
    #[serde(default, with = "runlane_util::duration::serde::option")]
    pub start_to_close_timeout: Option<Duration>,
    /// Limit on all attempts together, including backoff sleeps.
    #[serde(default, with = "runlane_util::duration::serde::option")]
    pub schedule_to_close_timeout: Option<Duration>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl ActivityOptions {
    /// Returns `self` with every unset field taken from `base`.
    pub fn layered_over(&self, base: &ActivityOptions) -> ActivityOptions {
        ActivityOptions {
            start_to_close_timeout: self.start_to_close_timeout.or(base.start_to_close_timeout),
            schedule_to_close_timeout: self.schedule_to_close_timeout.or(base.schedule_to_close_timeout),
            retry: self.retry.clone().or_else(|| base.retry.clone()),
        }
    }

    /// The retry policy in effect, falling back to the default policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }
}

/// A named reusable sub-pipeline ("custom check").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkflowBlock {
    /// Input names looked up in the caller's merged context and passed to the block.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Output expressions resolved after the block finishes.
    #[serde(default)]
    pub outputs: IndexMap<String, JsonValue>,
}

/// One step of a pipeline or block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepDefinition {
    /// Identifier, unique within its step list.
    pub id: String,
    /// Task key or custom-check name.
    #[serde(rename = "use")]
    pub uses: String,
    #[serde(default)]
    pub with: StepInputs,
    #[serde(default)]
    pub activity_options: Option<ActivityOptions>,
    /// Keep going when this step fails; the run still ends as failed.
    #[serde(default, alias = "continue-on-error")]
    pub continue_on_error: bool,
    #[serde(default)]
    pub metadata: IndexMap<String, JsonValue>,
}

/// Declared step inputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepInputs {
    #[serde(default, deserialize_with = "deserialize_string_map")]
    pub config: IndexMap<String, String>,
    #[serde(default)]
    pub payload: IndexMap<String, PayloadValue>,
}

/// A payload entry: either any JSON value or a `{type, value}` typed entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PayloadValue {
    Typed(TypedPayload),
    Plain(JsonValue),
}

impl PayloadValue {
    /// The raw (unresolved) value.
    pub fn raw(&self) -> &JsonValue {
        match self {
            PayloadValue::Typed(typed) => &typed.value,
            PayloadValue::Plain(value) => value,
        }
    }

    pub fn kind(&self) -> Option<PayloadKind> {
        match self {
            PayloadValue::Typed(typed) => Some(typed.kind),
            PayloadValue::Plain(_) => None,
        }
    }
}

impl From<JsonValue> for PayloadValue {
    fn from(value: JsonValue) -> Self {
        PayloadValue::Plain(value)
    }
}

/// Typed payload entry. Unknown `type` names fall back to [`PayloadValue::Plain`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TypedPayload {
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    pub value: JsonValue,
}

/// Declared type of a typed payload entry, applied after expression resolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    String,
    Number,
    Integer,
    Boolean,
    Map,
    List,
    /// A string holding JSON text, decoded into a value.
    Json,
    /// A bare reference path (no `${{ }}`), resolved to its native value.
    Ref,
}

impl PayloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadKind::String => "string",
            PayloadKind::Number => "number",
            PayloadKind::Integer => "integer",
            PayloadKind::Boolean => "boolean",
            PayloadKind::Map => "map",
            PayloadKind::List => "list",
            PayloadKind::Json => "json",
            PayloadKind::Ref => "ref",
        }
    }
}

/// Accepts scalar values (`retries: 3`, `verbose: true`) in string maps.
fn deserialize_string_map<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<IndexMap<String, JsonValue>> = Option::deserialize(deserializer)?;
    let mut map = IndexMap::new();
    for (key, value) in raw.unwrap_or_default() {
        let text = match value {
            JsonValue::String(text) => text,
            JsonValue::Null => String::new(),
            JsonValue::Bool(flag) => flag.to_string(),
            JsonValue::Number(number) => number.to_string(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "config value '{key}' must be a scalar, found {other}"
                )));
            }
        };
        map.insert(key, text);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PIPELINE: &str = r#"
name: smoke
runtime:
  namespace: mobile
  execution_timeout: 30m
  retry:
    max_attempts: 5
    initial_interval: 2s
config:
  region: eu
  shards: 4
runners: [acme/pixel-8]
steps:
  - id: login
    use: http/request
    with:
      config:
        base_url: https://example.test
      payload:
        path: /login
        attempts: { type: integer, value: "3" }
    activity_options:
      start_to_close_timeout: 45s
    continue-on-error: true
"#;

    #[test]
    fn parses_yaml_document() {
        let definition: WorkflowDefinition = serde_yaml::from_str(PIPELINE).expect("parse");
        assert_eq!(definition.name, "smoke");
        assert_eq!(definition.runtime.execution_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(definition.runtime.retry.as_ref().map(|retry| retry.max_attempts), Some(5));
        assert_eq!(definition.config["shards"], "4");
        assert!(definition.requires_runners());

        let step = &definition.steps[0];
        assert_eq!(step.uses, "http/request");
        assert!(step.continue_on_error);
        assert_eq!(step.with.config["base_url"], "https://example.test");
        assert_eq!(step.with.payload["path"], PayloadValue::Plain(json!("/login")));
        assert_eq!(step.with.payload["attempts"].kind(), Some(PayloadKind::Integer));
        assert_eq!(
            step.activity_options.as_ref().and_then(|options| options.start_to_close_timeout),
            Some(Duration::from_secs(45))
        );
    }

    #[test]
    fn unknown_typed_kind_stays_plain() {
        let value: PayloadValue = serde_json::from_value(json!({"type": "widget", "value": 1})).expect("decode");
        assert!(matches!(value, PayloadValue::Plain(_)));
    }

    #[test]
    fn layered_options_prefer_step_values() {
        let pipeline = ActivityOptions {
            start_to_close_timeout: Some(Duration::from_secs(60)),
            schedule_to_close_timeout: Some(Duration::from_secs(600)),
            retry: Some(RetryPolicy::default()),
        };
        let step = ActivityOptions {
            start_to_close_timeout: Some(Duration::from_secs(5)),
            schedule_to_close_timeout: None,
            retry: None,
        };

        let merged = step.layered_over(&pipeline);
        assert_eq!(merged.start_to_close_timeout, Some(Duration::from_secs(5)));
        assert_eq!(merged.schedule_to_close_timeout, Some(Duration::from_secs(600)));
        assert_eq!(merged.retry, Some(RetryPolicy::default()));
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 0,
            initial_interval: Duration::from_secs(1),
            maximum_interval: Duration::from_secs(5),
            backoff_coefficient: 2.0,
            non_retryable_errors: Vec::new(),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(5));
        assert!(policy.allows_attempt_after(1_000));
        assert!(!RetryPolicy::no_retry().allows_attempt_after(1));
    }
}
