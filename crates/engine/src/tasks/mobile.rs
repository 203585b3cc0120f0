//! `mobile/session`: boots an emulator session on the admitted runner.
//!
//! The session is started through the runner's control endpoint. On success
//! the activity registers its own teardown with the run's cleanup saga: the
//! emulator stop first, then (when recording) the artifact upload, so the
//! saga stops the recording before it stops the emulator.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use runlane_api::{CleanupArtifactRequest, DEFAULT_REQUEST_TIMEOUT, build_http_client};
use runlane_cleanup::action::{STOP_EMULATOR, STOP_RECORDING};
use runlane_types::{CleanupStepSpec, ValidationErrors};
use runlane_util::redact_sensitive;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::activity::{Activity, ActivityError, ActivityInput};

#[derive(Debug, Deserialize)]
struct RecordingRequest {
    video_path: String,
    last_frame_path: String,
}

#[derive(Debug, Deserialize)]
struct SessionRequest {
    /// Stamped by the runner admission hook.
    #[serde(default)]
    runner_id: String,
    #[serde(default)]
    version_id: Option<String>,
    start_url: String,
    stop_url: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    recording: Option<RecordingRequest>,
}

impl SessionRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        errors.require_non_empty("runner_id", &self.runner_id);
        errors.require_non_empty("start_url", &self.start_url);
        errors.require_non_empty("stop_url", &self.stop_url);
        if let Some(recording) = &self.recording {
            errors.require_non_empty("recording.video_path", &recording.video_path);
            errors.require_non_empty("recording.last_frame_path", &recording.last_frame_path);
        }
        errors.into_result(())
    }
}

pub struct MobileSessionActivity {
    http: Client,
}

impl MobileSessionActivity {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(None, DEFAULT_REQUEST_TIMEOUT)?,
        })
    }

    fn request(input: &ActivityInput) -> Result<SessionRequest, ActivityError> {
        let request: SessionRequest = input.decode()?;
        request.validate()?;
        Ok(request)
    }
}

#[async_trait]
impl Activity for MobileSessionActivity {
    fn name(&self) -> &str {
        "mobile/session"
    }

    async fn execute(&self, input: &ActivityInput, _cancel: &CancellationToken) -> Result<Value, ActivityError> {
        let request = Self::request(input)?;
        let mut call = self.http.post(&request.start_url).json(&json!({
            "runner_id": request.runner_id,
            "version_id": request.version_id,
            "workflow_id": input.run.workflow_id,
            "run_id": input.run.run_id,
        }));
        if let Some(token) = request.token.as_deref().filter(|token| !token.is_empty()) {
            call = call.bearer_auth(token);
        }

        let response = call
            .send()
            .await
            .map_err(|error| ActivityError::retryable("NETWORK", redact_sensitive(&error.to_string())))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let message = format!("session start answered HTTP {}: {}", status.as_u16(), redact_sensitive(&text));
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                ActivityError::retryable("SESSION_UNAVAILABLE", message)
            } else {
                ActivityError::non_retryable("SESSION_REJECTED", message)
            });
        }

        info!(step_id = %input.step_id, runner_id = %request.runner_id, "emulator session started");
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|error| ActivityError::non_retryable("SESSION_DECODE", format!("session start body is not JSON: {error}")))
    }

    fn compensation(&self, input: &ActivityInput, output: &Value) -> Vec<CleanupStepSpec> {
        let Ok(request) = Self::request(input) else {
            return Vec::new();
        };
        let mut steps = vec![CleanupStepSpec::new(
            format!("stop emulator {}", request.runner_id),
            STOP_EMULATOR,
            json!({
                "url": request.stop_url,
                "method": "POST",
                "body": {"runner_id": request.runner_id, "session": output},
                "token": request.token,
            }),
        )];

        if let Some(recording) = &request.recording {
            let artifacts = CleanupArtifactRequest {
                video_path: recording.video_path.clone(),
                last_frame_path: recording.last_frame_path.clone(),
                run_identifier: input.run.run_id.clone(),
                version_identifier: request.version_id.clone().unwrap_or_default(),
                instance_url: output
                    .get("instance_url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            };
            steps.push(CleanupStepSpec::new(
                format!("stop recording {}", request.runner_id),
                STOP_RECORDING,
                serde_json::to_value(&artifacts).unwrap_or(Value::Null),
            ));
        }
        steps
    }
}
