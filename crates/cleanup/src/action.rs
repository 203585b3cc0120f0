//! Cleanup actions and the registry that dispatches steps to them by type.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use runlane_api::{CleanupArtifactRequest, DEFAULT_REQUEST_TIMEOUT, HostClient, build_http_client};
use runlane_types::CleanupStepSpec;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::error::CleanupError;

/// Step type handled by [`ArtifactUploadAction`].
pub const STOP_RECORDING: &str = "stop-recording";
/// Step type for tearing down an emulator through its control endpoint.
pub const STOP_EMULATOR: &str = "stop-emulator";
/// Generic HTTP cleanup step.
pub const HTTP: &str = "http";

/// One kind of compensating action.
///
/// Implementations must be idempotent: a step can run again during
/// verification or reconciliation after it already succeeded.
#[async_trait]
pub trait CleanupAction: Send + Sync {
    async fn execute(&self, step: &CleanupStepSpec) -> Result<(), CleanupError>;
}

/// Maps step types to actions.
#[derive(Clone, Default)]
pub struct CleanupActionRegistry {
    actions: HashMap<String, Arc<dyn CleanupAction>>,
}

impl CleanupActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the shipped actions. `stop-recording` is only available
    /// when a host client is configured.
    pub fn with_defaults(host: Option<HostClient>) -> anyhow::Result<Self> {
        let http: Arc<dyn CleanupAction> = Arc::new(HttpCleanupAction::new()?);
        let mut registry = Self::new()
            .register(HTTP, http.clone())
            .register(STOP_EMULATOR, http);
        if let Some(host) = host {
            registry = registry.register(STOP_RECORDING, Arc::new(ArtifactUploadAction::new(host)));
        }
        Ok(registry)
    }

    pub fn register(mut self, step_type: impl Into<String>, action: Arc<dyn CleanupAction>) -> Self {
        self.actions.insert(step_type.into(), action);
        self
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.actions.contains_key(step_type)
    }

    pub fn step_types(&self) -> Vec<String> {
        let mut step_types: Vec<String> = self.actions.keys().cloned().collect();
        step_types.sort();
        step_types
    }

    /// Run one attempt of `step`, bounded by its timeout when it has one.
    pub async fn execute(&self, step: &CleanupStepSpec) -> Result<(), CleanupError> {
        let action = self
            .actions
            .get(&step.step_type)
            .ok_or_else(|| CleanupError::UnknownStepType {
                step_type: step.step_type.clone(),
            })?;
        match step.timeout {
            Some(timeout) => tokio::time::timeout(timeout, action.execute(step))
                .await
                .map_err(|_| CleanupError::Timeout {
                    step: step.name.clone(),
                    timeout,
                })?,
            None => action.execute(step).await,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HttpCleanupPayload {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Option<JsonValue>,
    #[serde(default)]
    token: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Calls the endpoint described by the step payload:
/// `{"url": "...", "method": "DELETE", "body": {...}, "token": "..."}`.
///
/// `404 Not Found` counts as success since the resource is already gone.
pub struct HttpCleanupAction {
    http: Client,
}

impl HttpCleanupAction {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(None, DEFAULT_REQUEST_TIMEOUT)?,
        })
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl CleanupAction for HttpCleanupAction {
    async fn execute(&self, step: &CleanupStepSpec) -> Result<(), CleanupError> {
        let payload: HttpCleanupPayload = serde_json::from_value(step.payload.clone())
            .map_err(|error| CleanupError::invalid_payload(&step.name, error.to_string()))?;
        let method = Method::from_bytes(payload.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| CleanupError::invalid_payload(&step.name, format!("unsupported method '{}'", payload.method)))?;

        let mut request = self.http.request(method, &payload.url);
        if let Some(token) = payload.token.as_deref().filter(|token| !token.is_empty()) {
            request = request.bearer_auth(token);
        }
        if let Some(body) = &payload.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|error| CleanupError::action(&step.name, error.to_string()))?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(step = %step.name, %status, "cleanup call finished");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(CleanupError::action(&step.name, format!("HTTP {status}: {body}")))
    }
}

/// Uploads the recording artifacts named in the payload to the hosting
/// application (`stop-recording` steps).
pub struct ArtifactUploadAction {
    host: HostClient,
}

impl ArtifactUploadAction {
    pub fn new(host: HostClient) -> Self {
        Self { host }
    }
}

#[async_trait]
impl CleanupAction for ArtifactUploadAction {
    async fn execute(&self, step: &CleanupStepSpec) -> Result<(), CleanupError> {
        let request: CleanupArtifactRequest = serde_json::from_value(step.payload.clone())
            .map_err(|error| CleanupError::invalid_payload(&step.name, error.to_string()))?;
        let response = self
            .host
            .post_cleanup_artifacts(&request)
            .await
            .map_err(|error| CleanupError::action(&step.name, error.to_string()))?;
        info!(
            step = %step.name,
            run_identifier = %request.run_identifier,
            results = response.result_urls.len(),
            screenshots = response.screenshot_urls.len(),
            "uploaded cleanup artifacts"
        );
        Ok(())
    }
}
