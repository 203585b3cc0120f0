//! Client for the external record store.
//!
//! The store exposes collections of JSON records under
//! `/api/collections/{collection}/records` and a canonical lookup endpoint
//! used to resolve runner references to runner ids.

use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{ApiError, DEFAULT_REQUEST_TIMEOUT, build_http_client, read_success_body, validate_base_url};

/// Records returned per page by [`RecordStoreClient::list`].
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// A runner as returned by the canonical lookup endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunnerRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListPage<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Clone)]
pub struct RecordStoreClient {
    base_url: String,
    http: Client,
}

impl RecordStoreClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        Ok(Self {
            base_url: validate_base_url(base_url)?,
            http: build_http_client(token, DEFAULT_REQUEST_TIMEOUT)?,
        })
    }

    fn records_url(&self, collection: &str) -> String {
        format!("{}/api/collections/{}/records", self.base_url, collection)
    }

    /// List records matching `filter`, first page only.
    pub async fn list<T: DeserializeOwned>(&self, collection: &str, filter: &str) -> Result<Vec<T>, ApiError> {
        let url = self.records_url(collection);
        let per_page = DEFAULT_PAGE_SIZE.to_string();
        let response = self
            .http
            .get(&url)
            .query(&[("filter", filter), ("perPage", per_page.as_str())])
            .send()
            .await
            .map_err(|error| ApiError::network(&url, error))?;
        let body = read_success_body(&url, response).await?;
        let page: ListPage<T> = serde_json::from_str(&body).map_err(|error| ApiError::decode(&url, error.to_string()))?;
        debug!(collection, count = page.items.len(), "listed records");
        Ok(page.items)
    }

    /// Create a record and return the id the store assigned.
    pub async fn create(&self, collection: &str, body: &JsonValue) -> Result<String, ApiError> {
        let url = self.records_url(collection);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|error| ApiError::network(&url, error))?;
        let text = read_success_body(&url, response).await?;
        let created: JsonValue = serde_json::from_str(&text).map_err(|error| ApiError::decode(&url, error.to_string()))?;
        created
            .get("id")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::decode(&url, "created record has no 'id'"))
    }

    pub async fn update(&self, collection: &str, id: &str, body: &JsonValue) -> Result<(), ApiError> {
        let url = format!("{}/{}", self.records_url(collection), id);
        let response = self
            .http
            .patch(&url)
            .json(body)
            .send()
            .await
            .map_err(|error| ApiError::network(&url, error))?;
        read_success_body(&url, response).await.map(|_| ())
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), ApiError> {
        let url = format!("{}/{}", self.records_url(collection), id);
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|error| ApiError::network(&url, error))?;
        read_success_body(&url, response).await.map(|_| ())
    }

    /// Resolve a canonical path (for example `acme/pixel-8`) inside a collection.
    pub async fn canonical<T: DeserializeOwned>(&self, collection: &str, path: &str) -> Result<T, ApiError> {
        let url = format!("{}/api/canonical/{}/{}", self.base_url, collection, path.trim_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|error| ApiError::network(&url, error))?;
        let body = read_success_body(&url, response).await?;
        serde_json::from_str(&body).map_err(|error| ApiError::decode(&url, error.to_string()))
    }

    /// Resolve a runner reference to its record.
    pub async fn find_runner(&self, collection: &str, reference: &str) -> Result<RunnerRecord, ApiError> {
        self.canonical(collection, reference).await
    }
}
