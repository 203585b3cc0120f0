//! Durable storage for semaphore state.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use runlane_types::SemaphoreState;
use tracing::debug;

use crate::{error::AdmissionError, semaphore_instance_id};

/// Persists one [`SemaphoreState`] snapshot per runner.
#[async_trait]
pub trait SemaphoreStore: Send + Sync {
    async fn load(&self, runner_id: &str) -> Result<Option<SemaphoreState>, AdmissionError>;

    async fn save(&self, state: &SemaphoreState) -> Result<(), AdmissionError>;
}

/// In-process store, used by tests and short-lived runs.
#[derive(Debug, Default)]
pub struct MemorySemaphoreStore {
    states: Mutex<HashMap<String, SemaphoreState>>,
}

impl MemorySemaphoreStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SemaphoreStore for MemorySemaphoreStore {
    async fn load(&self, runner_id: &str) -> Result<Option<SemaphoreState>, AdmissionError> {
        let states = self
            .states
            .lock()
            .map_err(|_| AdmissionError::unavailable(semaphore_instance_id(runner_id), "state lock poisoned"))?;
        Ok(states.get(runner_id).cloned())
    }

    async fn save(&self, state: &SemaphoreState) -> Result<(), AdmissionError> {
        let mut states = self
            .states
            .lock()
            .map_err(|_| AdmissionError::unavailable(semaphore_instance_id(&state.runner_id), "state lock poisoned"))?;
        states.insert(state.runner_id.clone(), state.clone());
        Ok(())
    }
}

/// JSON snapshots under a directory, one file per runner.
///
/// Writes go to a temporary sibling first and are renamed into place so a
/// crash never leaves a truncated snapshot behind.
#[derive(Debug, Clone)]
pub struct FileSemaphoreStore {
    root: PathBuf,
}

impl FileSemaphoreStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self, runner_id: &str) -> PathBuf {
        let file_name: String = runner_id
            .trim()
            .chars()
            .map(|character| {
                if character.is_ascii_alphanumeric() || matches!(character, '-' | '_' | '.') {
                    character
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{file_name}.json"))
    }
}

#[async_trait]
impl SemaphoreStore for FileSemaphoreStore {
    async fn load(&self, runner_id: &str) -> Result<Option<SemaphoreState>, AdmissionError> {
        let path = self.snapshot_path(runner_id);
        let instance_id = semaphore_instance_id(runner_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(AdmissionError::unavailable(
                    instance_id,
                    format!("read {}: {error}", path.display()),
                ));
            }
        };
        let state = serde_json::from_str(&text)
            .map_err(|error| AdmissionError::unavailable(instance_id, format!("parse {}: {error}", path.display())))?;
        debug!(runner_id, path = %path.display(), "restored semaphore snapshot");
        Ok(Some(state))
    }

    async fn save(&self, state: &SemaphoreState) -> Result<(), AdmissionError> {
        let instance_id = semaphore_instance_id(&state.runner_id);
        let path = self.snapshot_path(&state.runner_id);
        let staging = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(state)
            .map_err(|error| AdmissionError::unavailable(instance_id.clone(), format!("serialize state: {error}")))?;

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|error| AdmissionError::unavailable(instance_id.clone(), format!("create {}: {error}", self.root.display())))?;
        tokio::fs::write(&staging, text)
            .await
            .map_err(|error| AdmissionError::unavailable(instance_id.clone(), format!("write {}: {error}", staging.display())))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|error| AdmissionError::unavailable(instance_id, format!("rename {}: {error}", path.display())))?;
        Ok(())
    }
}
