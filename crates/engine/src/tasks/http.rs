//! `http/request`: one HTTP call described by the step payload.

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::{Client, Method, StatusCode};
use runlane_api::{DEFAULT_REQUEST_TIMEOUT, build_http_client};
use runlane_types::ValidationErrors;
use runlane_util::redact_sensitive;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::activity::{Activity, ActivityError, ActivityInput};

#[derive(Debug, Deserialize)]
struct HttpRequest {
    #[serde(default)]
    url: Option<String>,
    /// Joined to the `base_url` config value when `url` is absent.
    #[serde(default)]
    path: Option<String>,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: IndexMap<String, String>,
    #[serde(default)]
    query: IndexMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    token: Option<String>,
}

fn default_method() -> String {
    "GET".into()
}

impl HttpRequest {
    fn target(&self, input: &ActivityInput) -> Result<String, ValidationErrors> {
        if let Some(url) = self.url.as_deref().filter(|url| !url.trim().is_empty()) {
            return Ok(url.trim().to_string());
        }
        let Some(base) = input.config.get("base_url").filter(|base| !base.trim().is_empty()) else {
            return Err(ValidationErrors::single("url", "set url, or path together with a base_url config value"));
        };
        let path = self.path.as_deref().unwrap_or_default();
        Ok(format!("{}/{}", base.trim().trim_end_matches('/'), path.trim_start_matches('/')))
    }
}

/// Sends the request and returns the decoded response body.
///
/// Network failures, `429`, and `5xx` answers are retryable; other non-2xx
/// answers are not. A body that is not JSON is returned as a string.
pub struct HttpRequestActivity {
    http: Client,
}

impl HttpRequestActivity {
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
impl Activity for HttpRequestActivity {
    fn name(&self) -> &str {
        "http/request"
    }

    async fn execute(&self, input: &ActivityInput, _cancel: &CancellationToken) -> Result<Value, ActivityError> {
        let request: HttpRequest = input.decode()?;
        let url = request.target(input)?;
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ValidationErrors::single("method", format!("unsupported method '{}'", request.method)))?;

        let mut builder = self.http.request(method.clone(), &url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = request.token.as_deref().filter(|token| !token.is_empty()) {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(step_id = %input.step_id, %method, url = %url, "sending http request");
        let response = builder
            .send()
            .await
            .map_err(|error| ActivityError::retryable("NETWORK", redact_sensitive(&error.to_string())))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| ActivityError::retryable("NETWORK", error.to_string()))?;

        if !status.is_success() {
            let message = format!("{method} {url} answered HTTP {}: {}", status.as_u16(), redact_sensitive(&text));
            let code = format!("HTTP_{}", status.as_u16());
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                ActivityError::retryable(code, message)
            } else {
                ActivityError::non_retryable(code, message)
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}
