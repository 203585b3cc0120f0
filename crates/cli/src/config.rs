//! Process configuration for the `runlane` binary.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use runlane_types::ActivityOptions;
use runlane_util::{default_config_dir, default_data_dir, expand_tilde};
use serde::{Deserialize, Serialize};

/// Environment variable that points at an alternative config file.
pub const CONFIG_PATH_ENV: &str = "RUNLANE_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunlaneConfig {
    pub namespace: String,
    /// Where per-runner semaphore snapshots live.
    pub state_dir: PathBuf,
    pub host: Option<EndpointConfig>,
    pub record_store: Option<EndpointConfig>,
    pub activity: ActivityOptions,
    pub cleanup: CleanupConfig,
    pub admission: AdmissionConfig,
}

impl Default for RunlaneConfig {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            state_dir: default_data_dir().join("semaphores"),
            host: None,
            record_store: None,
            activity: ActivityOptions::default(),
            cleanup: CleanupConfig::default(),
            admission: AdmissionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    #[serde(with = "runlane_util::duration::serde")]
    pub reconcile_interval: Duration,
    pub reconcile_max_retries: u32,
    #[serde(with = "runlane_util::duration::serde")]
    pub verification_delay: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5 * 60),
            reconcile_max_retries: 5,
            verification_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub capacity: usize,
    /// 0 means unlimited.
    pub max_queue_depth: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            max_queue_depth: 0,
        }
    }
}

impl RunlaneConfig {
    /// Load from the default path and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_path(&default_config_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// A missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut config: RunlaneConfig = serde_json::from_str(&content).with_context(|| format!("parse config {}", path.display()))?;
        config.state_dir = expand_tilde(&config.state_dir.to_string_lossy());
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(namespace) = non_empty_var("RUNLANE_NAMESPACE") {
            self.namespace = namespace;
        }
        override_endpoint(&mut self.host, "RUNLANE_HOST_URL", "RUNLANE_HOST_TOKEN");
        override_endpoint(&mut self.record_store, "RUNLANE_RECORD_STORE_URL", "RUNLANE_RECORD_STORE_TOKEN");
    }
}

fn override_endpoint(endpoint: &mut Option<EndpointConfig>, url_var: &str, token_var: &str) {
    if let Some(base_url) = non_empty_var(url_var) {
        let token = endpoint.as_ref().and_then(|existing| existing.token.clone());
        *endpoint = Some(EndpointConfig { base_url, token });
    }
    if let Some(token) = non_empty_var(token_var)
        && let Some(existing) = endpoint.as_mut()
    {
        existing.token = Some(token);
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

/// `$RUNLANE_CONFIG_PATH`, else `<config_dir>/runlane/config.json`.
pub fn default_config_path() -> PathBuf {
    if let Some(path) = non_empty_var(CONFIG_PATH_ENV) {
        return expand_tilde(&path);
    }
    default_config_dir().join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunlaneConfig::load_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, RunlaneConfig::default());
        assert_eq!(config.cleanup.reconcile_interval, Duration::from_secs(300));
        assert_eq!(config.admission.capacity, 1);
    }

    #[test]
    fn parses_human_durations_and_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "namespace": "acme",
                "host": { "base_url": "https://host.example.com" },
                "cleanup": { "reconcile_interval": "30s" },
                "admission": { "max_queue_depth": 4 }
            }"#,
        )
        .unwrap();

        let config = RunlaneConfig::load_from_path(&path).unwrap();
        assert_eq!(config.namespace, "acme");
        assert_eq!(config.cleanup.reconcile_interval, Duration::from_secs(30));
        assert_eq!(config.cleanup.reconcile_max_retries, 5);
        assert_eq!(config.admission.capacity, 1);
        assert_eq!(config.admission.max_queue_depth, 4);
        assert_eq!(config.host.unwrap().token, None);
    }

    #[test]
    fn env_overrides_fill_in_endpoints() {
        temp_env::with_vars(
            [
                ("RUNLANE_NAMESPACE", Some("tenant-a")),
                ("RUNLANE_RECORD_STORE_URL", Some("http://localhost:8090")),
                ("RUNLANE_RECORD_STORE_TOKEN", Some("secret")),
                ("RUNLANE_HOST_URL", None),
                ("RUNLANE_HOST_TOKEN", Some("ignored")),
            ],
            || {
                let mut config = RunlaneConfig::default();
                config.apply_env_overrides();
                assert_eq!(config.namespace, "tenant-a");
                assert_eq!(
                    config.record_store,
                    Some(EndpointConfig {
                        base_url: "http://localhost:8090".into(),
                        token: Some("secret".into()),
                    })
                );
                assert_eq!(config.host, None);
            },
        );
    }

    #[test]
    fn config_path_honors_environment_override() {
        temp_env::with_var(CONFIG_PATH_ENV, Some("~/custom/runlane.json"), || {
            assert_eq!(default_config_path(), expand_tilde("~/custom/runlane.json"));
        });
    }
}
