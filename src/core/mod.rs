//! Core types for the drover run engine.
//!
//! This module provides the domain model shared by every other layer:
//!
//! # Domain Model
//! - [`Run`]: one invocation of a task, with its lifecycle [`RunStatus`]
//! - [`ExecutionSnapshot`]: append-only execution-state records; the latest
//!   snapshot is the single source of truth for where a run is
//! - [`Waitpoint`] / [`RunWaitpoint`]: completion tokens runs block on
//! - [`RunMessage`]: the queue element, stored body-by-reference
//!
//! # Serialization
//! - [`serialize_value`] / [`deserialize_value`]: JSON helpers for payloads,
//!   outputs and message bodies
//! - [`hash_payload`]: stable payload fingerprints for idempotency checks
//!
//! # Error Handling
//! - [`Error`]: core error type with proper error chains
//! - [`RunError`]: the structured `{code, message, stack}` object retained
//!   on terminally-failed runs

mod error;
mod message;
mod retry;
mod run;
mod serialization;
mod snapshot;
mod waitpoint;

pub use error::{Error, Result, RunError, RunErrorCode};
pub use message::{
    AttemptCompletion, AttemptExecution, AttemptStatus, CompleteAttemptResult, CompletedWaitpoint,
    DequeuedMessage, RunMessage,
};
pub use retry::RetryPolicy;
pub use run::{
    friendly_run_id, Attempt, EnvironmentType, Run, RunEnvironment, RunStatus, TaskQueue,
    TaskQueueType,
};
pub use serialization::{deserialize_value, hash_payload, serialize_value};
pub use snapshot::{ExecutionSnapshot, ExecutionStatus};
pub use waitpoint::{RunWaitpoint, Waitpoint, WaitpointKind, WaitpointStatus};
