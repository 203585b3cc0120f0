//! HTTP clients for Runlane's external collaborators.
//!
//! - [`HostClient`] posts pipeline execution results and cleanup artifacts
//!   back to the hosting application.
//! - [`RecordStoreClient`] reads and writes records in the external record
//!   store (failed cleanups, runner directory).
//!
//! Both clients share the same construction rules: the base URL is validated
//! (`localhost`/`127.0.0.1` may use any scheme, everything else must be
//! HTTPS), an optional bearer token becomes a default `Authorization` header,
//! and every request carries a Runlane User-Agent.

use std::{env, time::Duration};

use anyhow::{Context, anyhow};
use reqwest::{Client, StatusCode, header};
use thiserror::Error;
use url::Url;

pub mod host;
pub mod record_store;

pub use host::{CleanupArtifactRequest, CleanupArtifactResponse, HostClient, PipelineExecutionResult};
pub use record_store::{RecordStoreClient, RunnerRecord};

/// Hostnames allowed to use plain HTTP.
const LOCALHOST_DOMAINS: &[&str] = &["localhost", "127.0.0.1"];

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced by the HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("{url} answered HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("{url} returned an unexpected body: {message}")]
    Decode { url: String, message: String },

    #[error("record not found: {what}")]
    NotFound { what: String },
}

impl ApiError {
    /// Network failures, timeouts, throttling, and server errors are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network { .. } => true,
            ApiError::Status { status, .. } => *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16(),
            ApiError::Decode { .. } | ApiError::NotFound { .. } => false,
        }
    }

    pub(crate) fn network(url: &str, error: reqwest::Error) -> Self {
        ApiError::Network {
            url: url.to_string(),
            message: error.to_string(),
        }
    }

    pub(crate) fn decode(url: &str, message: impl Into<String>) -> Self {
        ApiError::Decode {
            url: url.to_string(),
            message: message.into(),
        }
    }
}

/// Build a `reqwest::Client` with Runlane defaults and an optional bearer token.
pub fn build_http_client(token: Option<&str>, timeout: Duration) -> anyhow::Result<Client> {
    let mut default_headers = header::HeaderMap::new();
    default_headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    if let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) {
        let value = header::HeaderValue::from_str(&format!("Bearer {token}")).context("bearer token is not a valid header value")?;
        default_headers.insert(header::AUTHORIZATION, value);
    }

    Client::builder()
        .default_headers(default_headers)
        .user_agent(format!("runlane/{}; {}", env!("CARGO_PKG_VERSION"), env::consts::OS))
        .timeout(timeout)
        .build()
        .context("build http client")
}

/// Validate that a base URL is acceptable and strip any trailing slash.
///
/// Rules:
/// - `localhost` or `127.0.0.1`: any scheme is allowed
/// - otherwise: scheme must be HTTPS
pub fn validate_base_url(base: &str) -> anyhow::Result<String> {
    let parsed_base_url = Url::parse(base.trim()).map_err(|error| anyhow!("invalid base URL '{}': {}", base, error))?;

    let host_name = parsed_base_url
        .host_str()
        .ok_or_else(|| anyhow!("base URL '{}' must include a host", base))?;

    let is_local = LOCALHOST_DOMAINS
        .iter()
        .any(|&allowed| host_name.eq_ignore_ascii_case(allowed));
    if !is_local && parsed_base_url.scheme() != "https" {
        return Err(anyhow!(
            "base URL must use https for non-localhost hosts; got '{}://'",
            parsed_base_url.scheme()
        ));
    }

    Ok(base.trim().trim_end_matches('/').to_string())
}

/// Read a response body, turning non-success statuses into [`ApiError::Status`].
pub(crate) async fn read_success_body(url: &str, response: reqwest::Response) -> Result<String, ApiError> {
    let status = response.status();
    let body = response.text().await.map_err(|error| ApiError::network(url, error))?;
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound { what: url.to_string() });
    }
    if !status.is_success() {
        return Err(ApiError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body: runlane_util::redact_sensitive(&body),
        });
    }
    Ok(body)
}
