//! Strongly typed data shared by the Runlane engine, admission queue, cleanup
//! saga, and CLI.
//!
//! Everything in this crate is plain serde data plus small helpers; behaviour
//! lives in the crates that own each concern.

pub mod admission;
pub mod cleanup;
pub mod field_errors;
pub mod workflow;

pub use admission::{
    EnqueueResponse, PendingGrant, RunIdentity, RunStatus, RunStatusView, RunTicketRequest, RunTicketState, SemaphoreState,
};
pub use cleanup::{CleanupStepSpec, FailedCleanupRecord, FailedCleanupStatus};
pub use field_errors::{FieldError, ValidationErrors};
pub use workflow::{
    ActivityOptions, PayloadKind, PayloadValue, RetryPolicy, RuntimePolicy, StepDefinition, StepInputs, TypedPayload,
    WorkflowBlock, WorkflowDefinition,
};
