//! General-purpose tasks: echo, template rendering, deliberate failure, sleep.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use runlane_types::ValidationErrors;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::{
    activity::{Activity, ActivityError, ActivityInput},
    resolve::{resolve_reference, stringify},
};

/// Returns its payload unchanged.
pub struct EchoActivity;

#[async_trait]
impl Activity for EchoActivity {
    fn name(&self) -> &str {
        "core/echo"
    }

    async fn execute(&self, input: &ActivityInput, _cancel: &CancellationToken) -> Result<Value, ActivityError> {
        Ok(Value::Object(input.payload.clone()))
    }
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\$)?\{\{\s*([^{}\s]+)\s*\}\}").expect("placeholder pattern"));

/// Renders the `template` payload key against the `vars` map.
///
/// Placeholders use `{{ name }}` (dotted paths allowed); `${{ }}` run
/// references are left alone. The template key is registered verbatim so
/// the step resolver does not interpolate it first.
pub struct TemplateActivity;

impl TemplateActivity {
    pub const TEMPLATE_KEY: &'static str = "template";
    pub const VARS_KEY: &'static str = "vars";
    pub const RENDERED_KEY: &'static str = "rendered";
}

/// Substitute `{{ path }}` placeholders from `vars`.
pub fn render_template(template: &str, vars: &Value) -> Result<String, ValidationErrors> {
    let mut errors = ValidationErrors::new();
    let rendered = PLACEHOLDER.replace_all(template, |captures: &Captures| {
        let whole = captures.get(0).map_or("", |matched| matched.as_str());
        if captures.get(1).is_some() {
            return whole.to_string();
        }
        let path = captures.get(2).map_or("", |matched| matched.as_str());
        match resolve_reference(path, vars) {
            Ok(value) => stringify(&value),
            Err(error) => {
                errors.push(format!("vars.{path}"), error.reason());
                whole.to_string()
            }
        }
    });
    let rendered = rendered.into_owned();
    errors.into_result(rendered)
}

#[async_trait]
impl Activity for TemplateActivity {
    fn name(&self) -> &str {
        "core/template"
    }

    fn configure(&self, mut input: ActivityInput) -> Result<ActivityInput, ActivityError> {
        let template = match input.payload.get(Self::TEMPLATE_KEY) {
            Some(Value::String(template)) => template.clone(),
            _ => return Err(ValidationErrors::single(Self::TEMPLATE_KEY, "must be a string").into()),
        };
        let vars = input.payload.get(Self::VARS_KEY).cloned().unwrap_or_else(|| json!({}));
        let rendered = render_template(&template, &vars)?;
        input.payload.insert(Self::RENDERED_KEY.into(), Value::String(rendered));
        Ok(input)
    }

    async fn execute(&self, input: &ActivityInput, _cancel: &CancellationToken) -> Result<Value, ActivityError> {
        input
            .payload
            .get(Self::RENDERED_KEY)
            .cloned()
            .ok_or_else(|| ActivityError::non_retryable("NOT_CONFIGURED", "template was not rendered"))
    }
}

#[derive(Debug, Deserialize)]
struct FailRequest {
    #[serde(default = "default_fail_message")]
    message: String,
    #[serde(default = "default_fail_code")]
    code: String,
    #[serde(default)]
    retryable: bool,
}

fn default_fail_message() -> String {
    "failed on request".into()
}

fn default_fail_code() -> String {
    "FAILED".into()
}

/// Always fails with the configured error.
pub struct FailActivity;

#[async_trait]
impl Activity for FailActivity {
    fn name(&self) -> &str {
        "core/fail"
    }

    async fn execute(&self, input: &ActivityInput, _cancel: &CancellationToken) -> Result<Value, ActivityError> {
        let request: FailRequest = input.decode()?;
        Err(ActivityError::Application {
            code: request.code,
            message: request.message,
            retryable: request.retryable,
        })
    }
}

/// Waits for `duration` (`"250ms"`, `"2s"`, or seconds as a number).
pub struct SleepActivity;

fn sleep_duration(input: &ActivityInput) -> Result<Duration, ActivityError> {
    let invalid = |message: String| ActivityError::Validation(ValidationErrors::single("duration", message));
    match input.payload.get("duration") {
        Some(Value::Number(seconds)) => seconds
            .as_f64()
            .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| invalid(format!("invalid duration {seconds}"))),
        Some(Value::String(text)) => runlane_util::parse_duration(text).map_err(|error| invalid(error.to_string())),
        _ => Err(invalid("must be a duration string or a number of seconds".into())),
    }
}

#[async_trait]
impl Activity for SleepActivity {
    fn name(&self) -> &str {
        "core/sleep"
    }

    async fn execute(&self, input: &ActivityInput, cancel: &CancellationToken) -> Result<Value, ActivityError> {
        let duration = sleep_duration(input)?;
        tokio::select! {
            _ = cancel.cancelled() => Err(ActivityError::Canceled),
            _ = tokio::time::sleep(duration) => Ok(json!({"slept_ms": duration.as_millis() as u64})),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(payload: Value) -> ActivityInput {
        ActivityInput {
            payload: payload.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn renders_placeholders_and_keeps_run_references() {
        let vars = json!({"name": "Ada", "device": {"model": "Pixel 8"}});
        let rendered = render_template("Hi {{ name }} on {{device.model}} (${{ run.id }})", &vars).expect("render");
        assert_eq!(rendered, "Hi Ada on Pixel 8 (${{ run.id }})");
    }

    #[test]
    fn missing_template_variables_are_reported() {
        let errors = render_template("{{ a }} {{ b.c }}", &json!({"b": {}})).expect_err("missing");
        let fields: Vec<&str> = errors.errors.iter().map(|error| error.field.as_str()).collect();
        assert_eq!(fields, vec!["vars.a", "vars.b.c"]);
    }

    #[tokio::test]
    async fn template_configure_then_execute() {
        let configured = TemplateActivity
            .configure(input(json!({"template": "v{{ major }}", "vars": {"major": 2}})))
            .expect("configure");
        let output = TemplateActivity
            .execute(&configured, &CancellationToken::new())
            .await
            .expect("execute");
        assert_eq!(output, json!("v2"));
    }

    #[tokio::test]
    async fn fail_uses_requested_error() {
        let error = FailActivity
            .execute(&input(json!({"code": "FLAKY", "retryable": true})), &CancellationToken::new())
            .await
            .expect_err("fails");
        assert_eq!(error.code(), "FLAKY");
        assert!(error.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_waits_for_duration() {
        let started = tokio::time::Instant::now();
        let output = SleepActivity
            .execute(&input(json!({"duration": "2s"})), &CancellationToken::new())
            .await
            .expect("sleep");
        assert_eq!(output, json!({"slept_ms": 2000}));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert!(SleepActivity.execute(&input(json!({})), &CancellationToken::new()).await.is_err());
    }
}
