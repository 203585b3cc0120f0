//! Compensating cleanup steps and the records kept for ones that keep failing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use runlane_util::format_duration;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

/// One compensating action appended to a run as it acquires a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanupStepSpec {
    pub name: String,
    /// Action type, for example `stop-emulator` or `stop-recording`.
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub payload: JsonValue,
    /// Attempts before the step is reported as failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Limit on a single attempt.
    #[serde(default, with = "runlane_util::duration::serde::option")]
    pub timeout: Option<Duration>,
    /// Whether the step may run again after it succeeded or partly ran.
    /// Verification and reconciliation only re-run idempotent steps.
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_idempotent() -> bool {
    true
}

impl CleanupStepSpec {
    pub fn new(name: impl Into<String>, step_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            payload,
            max_retries: default_max_retries(),
            timeout: None,
            idempotent: default_idempotent(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }
}

/// State of a persisted cleanup failure.
///
/// A record is RETRYING while a reconciliation attempt is in flight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailedCleanupStatus {
    Pending,
    Retrying,
    Abandoned,
}

impl FailedCleanupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FailedCleanupStatus::Pending => "PENDING",
            FailedCleanupStatus::Retrying => "RETRYING",
            FailedCleanupStatus::Abandoned => "ABANDONED",
        }
    }
}

/// A cleanup step that exhausted its retries, stored in the `failed_cleanups` collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedCleanupRecord {
    /// Record-store id; empty until persisted.
    #[serde(default)]
    pub id: String,
    pub workflow_id: String,
    pub step_name: String,
    #[serde(default)]
    pub step_type: String,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default)]
    pub retry_count: u32,
    pub status: FailedCleanupStatus,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    /// Per-attempt limit carried over from the step.
    #[serde(default, with = "runlane_util::duration::serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
}

impl FailedCleanupRecord {
    /// A fresh PENDING record for a step of `workflow_id`.
    pub fn pending(workflow_id: impl Into<String>, step: &CleanupStepSpec, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: String::new(),
            workflow_id: workflow_id.into(),
            step_name: step.name.clone(),
            step_type: step.step_type.clone(),
            payload: step.payload.clone(),
            retry_count: 0,
            status: FailedCleanupStatus::Pending,
            error: error.into(),
            last_attempt: Some(at),
            timeout: step.timeout,
            idempotent: step.idempotent,
        }
    }

    /// Whether a reconciliation sweep should pick this record up.
    pub fn is_open(&self) -> bool {
        matches!(self.status, FailedCleanupStatus::Pending | FailedCleanupStatus::Retrying)
    }

    /// The single cleanup step this record re-executes.
    pub fn to_step_spec(&self) -> CleanupStepSpec {
        CleanupStepSpec {
            name: self.step_name.clone(),
            step_type: self.step_type.clone(),
            payload: self.payload.clone(),
            max_retries: 1,
            timeout: self.timeout,
            idempotent: self.idempotent,
        }
    }

    /// Body written to the record store (without the store-owned `id`).
    pub fn to_store_body(&self) -> JsonValue {
        json!({
            "workflow_id": self.workflow_id,
            "step_name": self.step_name,
            "step_type": self.step_type,
            "payload": self.payload,
            "retry_count": self.retry_count,
            "status": self.status,
            "error": self.error,
            "last_attempt": self.last_attempt,
            "timeout": self.timeout.map(format_duration),
            "idempotent": self.idempotent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_store_shape() {
        let step = CleanupStepSpec::new("stop-emulator", "stop-emulator", json!({"emulator_id": "e1"}))
            .with_timeout(Duration::from_secs(45));
        let record = FailedCleanupRecord::pending("wf-1", &step, "connection refused", Utc::now());

        let body = record.to_store_body();
        assert_eq!(body["status"], "PENDING");
        assert_eq!(body["payload"]["emulator_id"], "e1");
        assert_eq!(body["timeout"], "45s");

        let replay = record.to_step_spec();
        assert_eq!(replay.max_retries, 1);
        assert_eq!(replay.step_type, "stop-emulator");
        assert_eq!(replay.timeout, Some(Duration::from_secs(45)));
        assert!(replay.idempotent);
    }

    #[test]
    fn stored_record_keeps_timeout_and_idempotence() {
        let mut body = json!({
            "id": "fc_1",
            "workflow_id": "wf-1",
            "step_name": "rec",
            "step_type": "stop-recording",
            "status": "RETRYING",
            "timeout": "2m",
            "idempotent": false,
        });
        let record: FailedCleanupRecord = serde_json::from_value(body.clone()).expect("decode");
        assert!(record.is_open());
        let replay = record.to_step_spec();
        assert_eq!(replay.timeout, Some(Duration::from_secs(120)));
        assert!(!replay.idempotent);

        // Records written before the fields existed replay as idempotent with no limit.
        body.as_object_mut().expect("object").retain(|key, _| key != "timeout" && key != "idempotent");
        let legacy: FailedCleanupRecord = serde_json::from_value(body).expect("decode legacy");
        assert_eq!(legacy.to_step_spec().timeout, None);
        assert!(legacy.idempotent);
    }

    #[test]
    fn cleanup_step_defaults() {
        let step: CleanupStepSpec = serde_json::from_value(json!({"name": "rec", "type": "stop-recording"})).expect("decode");
        assert_eq!(step.max_retries, 3);
        assert_eq!(step.timeout, None);
        assert!(step.idempotent);
        assert_eq!(step, CleanupStepSpec::new("rec", "stop-recording", JsonValue::Null));
    }
}
