//! Client for the application hosting Runlane pipelines.

use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{ApiError, DEFAULT_REQUEST_TIMEOUT, build_http_client, read_success_body, validate_base_url};

const EXECUTION_RESULTS_PATH: &str = "/api/pipeline-executions";
const CLEANUP_ARTIFACTS_PATH: &str = "/api/cleanup-artifacts";

/// Execution result reported after every pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineExecutionResult {
    /// Namespace that owns the run.
    pub owner: String,
    pub pipeline_id: String,
    pub workflow_id: String,
    pub run_id: String,
}

/// Recorded artifacts to upload when a recording is stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CleanupArtifactRequest {
    pub video_path: String,
    pub last_frame_path: String,
    pub run_identifier: String,
    pub version_identifier: String,
    pub instance_url: String,
}

/// Where the host stored the uploaded artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CleanupArtifactResponse {
    #[serde(default)]
    pub result_urls: Vec<String>,
    #[serde(default)]
    pub screenshot_urls: Vec<String>,
}

/// Thin HTTP client for the host application's callback endpoints.
#[derive(Debug, Clone)]
pub struct HostClient {
    base_url: String,
    http: Client,
}

impl HostClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        Ok(Self {
            base_url: validate_base_url(base_url)?,
            http: build_http_client(token, DEFAULT_REQUEST_TIMEOUT)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Report a finished run. The host's answer body is ignored.
    pub async fn post_execution_result(&self, result: &PipelineExecutionResult) -> Result<(), ApiError> {
        let url = format!("{}{}", self.base_url, EXECUTION_RESULTS_PATH);
        debug!(workflow_id = %result.workflow_id, pipeline_id = %result.pipeline_id, "posting execution result");
        let response = self
            .http
            .post(&url)
            .json(result)
            .send()
            .await
            .map_err(|error| ApiError::network(&url, error))?;
        read_success_body(&url, response).await.map(|_| ())
    }

    /// Upload recording artifacts and return the stored URLs.
    ///
    /// The host must answer HTTP 200 with both `result_urls` and
    /// `screenshot_urls` present; anything else is a failure.
    pub async fn post_cleanup_artifacts(&self, request: &CleanupArtifactRequest) -> Result<CleanupArtifactResponse, ApiError> {
        let url = format!("{}{}", self.base_url, CLEANUP_ARTIFACTS_PATH);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|error| ApiError::network(&url, error))?;
        let status = response.status();
        let body = read_success_body(&url, response).await?;
        if status != reqwest::StatusCode::OK {
            return Err(ApiError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }

        let value: serde_json::Value = serde_json::from_str(&body).map_err(|error| ApiError::decode(&url, error.to_string()))?;
        for field in ["result_urls", "screenshot_urls"] {
            if value.get(field).is_none() {
                warn!(%url, field, "cleanup artifact response is missing a field");
                return Err(ApiError::decode(&url, format!("missing '{field}'")));
            }
        }
        serde_json::from_value(value).map_err(|error| ApiError::decode(&url, error.to_string()))
    }
}
