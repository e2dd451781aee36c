//! Drover: a durable, distributed run engine for background-task platforms.
//!
//! Drover accepts *trigger* requests for user-defined tasks, enqueues them
//! onto fair, weighted, multi-tenant priority queues, dispatches them to
//! remote runner processes, and tracks each run through its execution
//! lifecycle — suspension on waitpoints (time-based or run-to-run
//! dependencies), warm-start handoff, retries, and crash recovery.
//!
//! # The three co-designed pieces
//!
//! - **Run queue** ([`queue`]): Redis-backed two-level priority queue with
//!   per-organization/per-environment/per-queue concurrency enforcement.
//!   Claims are atomic server-side scripts, so limits hold at the moment a
//!   dequeue returns.
//! - **Run engine** ([`engine`]): the run state machine over a relational
//!   store, driven by append-only *execution snapshots* and *waitpoints*,
//!   coordinated by distributed per-run locks.
//! - **Supervisor/runner protocol** ([`supervisor`], [`runner`]): the
//!   dequeue → start-attempt → heartbeat → complete / suspend / resume
//!   conversation with remote run-processes, including warm starts.
//!
//! They share invariants — a run is in exactly one place (queue, blocked
//! set, or executing); concurrency budgets are never exceeded; snapshots
//! are append-only — and are built together.
//!
//! # Quick Start
//!
//! ```no_run
//! use drover::core::{EnvironmentType, RunEnvironment};
//! use drover::engine::{RunEngine, TriggerRequest};
//! use drover::runner::{Runner, TaskOutcome, TaskRegistry};
//! use drover::supervisor::Supervisor;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Arc::new(RunEngine::in_memory());
//!     let env = RunEnvironment::new("org", "proj", "env", EnvironmentType::Production);
//!
//!     let run = engine
//!         .trigger(TriggerRequest::new("hello", r#"{"name":"world"}"#, env.clone()))
//!         .await?;
//!     println!("triggered {}", run.friendly_id);
//!
//!     let mut registry = TaskRegistry::new();
//!     registry.register("hello", |_ctx| async move {
//!         TaskOutcome::Success("\"hi\"".to_string())
//!     });
//!
//!     let master = engine.master_queue_key(&env, None);
//!     let supervisor = Arc::new(Supervisor::new(Arc::clone(&engine), "consumer-1", master));
//!     let runner = Runner::new(supervisor, Arc::new(registry), "runner-1");
//!     runner.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! Each module hides one set of design decisions:
//!
//! - [`core`]: domain model (hides representation and wire format)
//! - [`queue`]: run queue (hides key layout and claim scripts)
//! - [`store`]: persistence (hides database choice and schema)
//! - [`delayed`]: durable timers (hides scheduling representation)
//! - [`engine`]: orchestration (hides the state machine's transitions)
//! - [`supervisor`] / [`runner`]: the two protocol halves
//! - [`notify`]: best-effort push channel between them

pub mod core;
pub mod delayed;
pub mod engine;
pub mod notify;
pub mod queue;
pub mod runner;
pub mod store;
pub mod supervisor;

// Re-export commonly used types for convenience
pub use crate::core::{
    AttemptCompletion, AttemptStatus, EnvironmentType, Run, RunEnvironment, RunError,
    RunErrorCode, RunStatus,
};
pub use engine::{EngineConfig, EngineError, RunEngine, TriggerRequest};

// Re-export dependencies used in public API so downstream crates don't hit
// version mismatches.
pub use chrono;
pub use serde;
pub use tokio;
pub use uuid;

/// Prelude module for convenient glob imports.
///
/// # Example
///
/// ```ignore
/// use drover::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{
        AttemptCompletion, AttemptStatus, EnvironmentType, ExecutionStatus, Run, RunEnvironment,
        RunError, RunErrorCode, RunStatus, WaitpointKind,
    };
    pub use crate::delayed::{DelayedJobWorker, InMemoryDelayedJobQueue};
    pub use crate::engine::{EngineConfig, RunEngine, TriggerRequest};
    pub use crate::notify::InProcessNotifier;
    pub use crate::queue::{InMemoryRunQueue, QueueConfig};
    pub use crate::runner::{Runner, TaskContext, TaskOutcome, TaskRegistry};
    pub use crate::store::InMemoryRunStore;
    pub use crate::supervisor::{PlatformClient, Supervisor};

    #[cfg(feature = "redis")]
    pub use crate::delayed::RedisDelayedJobQueue;
    #[cfg(feature = "redis")]
    pub use crate::queue::RedisRunQueue;
    #[cfg(feature = "postgres")]
    pub use crate::store::PostgresRunStore;

    pub use std::sync::Arc;
    pub use uuid::Uuid;
}
