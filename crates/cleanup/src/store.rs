//! Persistence of cleanup steps that exhausted their retries.

use std::sync::Mutex;

use async_trait::async_trait;
use runlane_api::RecordStoreClient;
use runlane_types::FailedCleanupRecord;
use serde_json::json;
use tracing::debug;

use crate::error::StoreError;

/// Record-store collection holding failed cleanups.
pub const FAILED_CLEANUPS_COLLECTION: &str = "failed_cleanups";

#[async_trait]
pub trait FailedCleanupStore: Send + Sync {
    /// Persist a failure and return the record id.
    ///
    /// When an open record already exists for the same workflow and step,
    /// that record is refreshed instead of creating a second one.
    async fn record_failure(&self, record: FailedCleanupRecord) -> Result<String, StoreError>;

    /// Open records whose retry count is below `retry_ceiling`.
    ///
    /// RETRYING records are included so one left behind by an interrupted
    /// sweep is attempted again.
    async fn list_pending(&self, retry_ceiling: u32) -> Result<Vec<FailedCleanupRecord>, StoreError>;

    /// Delete the open records of a step that has since succeeded.
    /// Returns how many were removed.
    async fn resolve(&self, workflow_id: &str, step_name: &str) -> Result<usize, StoreError>;

    async fn update(&self, record: &FailedCleanupRecord) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// In-process store, used by tests and by runs without a record store.
#[derive(Debug, Default)]
pub struct MemoryFailedCleanupStore {
    records: Mutex<Vec<FailedCleanupRecord>>,
    next_id: Mutex<u64>,
}

impl MemoryFailedCleanupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FailedCleanupRecord> {
        self.records.lock().map(|records| records.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<FailedCleanupRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::backend("failed-cleanup store lock poisoned"))
    }
}

#[async_trait]
impl FailedCleanupStore for MemoryFailedCleanupStore {
    async fn record_failure(&self, mut record: FailedCleanupRecord) -> Result<String, StoreError> {
        let mut records = self.lock()?;
        if let Some(existing) = records.iter_mut().find(|existing| {
            existing.is_open() && existing.workflow_id == record.workflow_id && existing.step_name == record.step_name
        }) {
            existing.error = record.error;
            existing.last_attempt = record.last_attempt;
            return Ok(existing.id.clone());
        }

        let id = {
            let mut next_id = self
                .next_id
                .lock()
                .map_err(|_| StoreError::backend("id counter lock poisoned"))?;
            *next_id += 1;
            format!("fc_{next_id}")
        };
        record.id = id.clone();
        records.push(record);
        Ok(id)
    }

    async fn list_pending(&self, retry_ceiling: u32) -> Result<Vec<FailedCleanupRecord>, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|record| record.is_open() && record.retry_count < retry_ceiling)
            .cloned()
            .collect())
    }

    async fn resolve(&self, workflow_id: &str, step_name: &str) -> Result<usize, StoreError> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|record| !(record.is_open() && record.workflow_id == workflow_id && record.step_name == step_name));
        Ok(before - records.len())
    }

    async fn update(&self, record: &FailedCleanupRecord) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        let existing = records
            .iter_mut()
            .find(|existing| existing.id == record.id)
            .ok_or_else(|| StoreError::NotFound { id: record.id.clone() })?;
        *existing = record.clone();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|record| record.id != id);
        if records.len() == before {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }
}

/// Failed cleanups kept in the external record store.
#[derive(Debug, Clone)]
pub struct RecordStoreFailedCleanups {
    client: RecordStoreClient,
    collection: String,
}

impl RecordStoreFailedCleanups {
    pub fn new(client: RecordStoreClient) -> Self {
        Self {
            client,
            collection: FAILED_CLEANUPS_COLLECTION.to_string(),
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }
}

/// Quote a value for a record-store filter expression.
fn filter_literal(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

const OPEN_STATUS_FILTER: &str = "(status = \"PENDING\" || status = \"RETRYING\")";

fn open_step_filter(workflow_id: &str, step_name: &str) -> String {
    format!(
        "workflow_id = {} && step_name = {} && {OPEN_STATUS_FILTER}",
        filter_literal(workflow_id),
        filter_literal(step_name)
    )
}

#[async_trait]
impl FailedCleanupStore for RecordStoreFailedCleanups {
    async fn record_failure(&self, record: FailedCleanupRecord) -> Result<String, StoreError> {
        let filter = open_step_filter(&record.workflow_id, &record.step_name);
        let existing: Vec<FailedCleanupRecord> = self.client.list(&self.collection, &filter).await?;
        if let Some(existing) = existing.into_iter().next() {
            debug!(id = %existing.id, workflow_id = %record.workflow_id, step = %record.step_name, "refreshing pending failed cleanup");
            self.client
                .update(
                    &self.collection,
                    &existing.id,
                    &json!({"error": record.error, "last_attempt": record.last_attempt}),
                )
                .await?;
            return Ok(existing.id);
        }
        Ok(self.client.create(&self.collection, &record.to_store_body()).await?)
    }

    async fn list_pending(&self, retry_ceiling: u32) -> Result<Vec<FailedCleanupRecord>, StoreError> {
        let filter = format!("{OPEN_STATUS_FILTER} && retry_count < {retry_ceiling}");
        Ok(self.client.list(&self.collection, &filter).await?)
    }

    async fn resolve(&self, workflow_id: &str, step_name: &str) -> Result<usize, StoreError> {
        let open: Vec<FailedCleanupRecord> = self
            .client
            .list(&self.collection, &open_step_filter(workflow_id, step_name))
            .await?;
        for record in &open {
            debug!(id = %record.id, workflow_id, step = step_name, "resolving failed cleanup");
            self.client.delete(&self.collection, &record.id).await?;
        }
        Ok(open.len())
    }

    async fn update(&self, record: &FailedCleanupRecord) -> Result<(), StoreError> {
        Ok(self
            .client
            .update(&self.collection, &record.id, &record.to_store_body())
            .await?)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        Ok(self.client.delete(&self.collection, id).await?)
    }
}
