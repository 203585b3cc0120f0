//! Compensating cleanup for pipeline runs.
//!
//! A run appends [`CleanupStepSpec`](runlane_types::CleanupStepSpec)s to its
//! [`CleanupSaga`] as it acquires resources. When the run ends, successfully
//! or not, the saga undoes them in reverse. Steps that keep failing are
//! persisted through a [`FailedCleanupStore`] and retried later by the
//! [`Reconciler`]; [`verify_cleanup`] re-runs a saga shortly after a run to
//! catch teardown failures early.

pub mod action;
pub mod error;
pub mod reconcile;
pub mod saga;
pub mod store;
pub mod verify;

pub use action::{ArtifactUploadAction, CleanupAction, CleanupActionRegistry, HttpCleanupAction};
pub use error::{CleanupError, StoreError};
pub use reconcile::{ReconcileSummary, Reconciler, SweepReport};
pub use saga::{CleanupSaga, FailureRecorder, SagaReport, StepFailure};
pub use store::{FailedCleanupStore, MemoryFailedCleanupStore, RecordStoreFailedCleanups};
pub use verify::{schedule_verification, verify_cleanup};
