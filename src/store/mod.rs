//! Persistence for runs, snapshots, waitpoints and attempts.
//!
//! The store is the system of record for the run state machine. Snapshots
//! are append-only (created only by the engine, never mutated, never
//! deleted); everything else mutates only under the run's distributed lock,
//! except waitpoint completion which is transactional inside the backend.
//!
//! # Backends
//!
//! - [`PostgresRunStore`]: production backend on sqlx.
//! - [`InMemoryRunStore`]: DashMap-backed store for tests and embedded use.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::InMemoryRunStore;
#[cfg(feature = "postgres")]
pub use postgres::{PoolConfig, PostgresRunStore};

use crate::core::{
    Attempt, ExecutionSnapshot, Run, RunError, RunWaitpoint, TaskQueue, Waitpoint,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Storage layer error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A database operation failed.
    #[cfg(feature = "postgres")]
    #[error("database operation failed")]
    Database(#[from] sqlx::Error),

    /// A core serialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] crate::core::Error),

    /// A connection error occurred.
    #[error("connection error: {0}")]
    Connection(String),

    /// The requested run was not found.
    #[error("run not found: id={0}")]
    RunNotFound(Uuid),

    /// The requested waitpoint was not found.
    #[error("waitpoint not found: id={0}")]
    WaitpointNotFound(Uuid),

    /// The requested attempt was not found.
    #[error("attempt not found: id={0}")]
    AttemptNotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of completing a waitpoint.
#[derive(Debug, Clone)]
pub struct WaitpointCompletion {
    pub waitpoint: Waitpoint,
    /// Runs that were blocked by this waitpoint and now have no blocking
    /// rows left. The engine decides which of them actually continue.
    pub unblocked_run_ids: Vec<Uuid>,
}

/// Persistence operations the engine depends on.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>>;

    /// Full-row update; callers hold the run's distributed lock.
    async fn update_run(&self, run: &Run) -> Result<()>;

    /// Looks up a non-terminal run with this idempotency key in the
    /// environment, for trigger deduplication.
    async fn find_run_by_idempotency_key(
        &self,
        environment_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Run>>;

    /// Creates the next attempt for a run, bumping its attempt count.
    async fn create_attempt(&self, run_id: Uuid) -> Result<Attempt>;

    async fn finalize_attempt(&self, attempt_id: Uuid, error: Option<RunError>) -> Result<()>;

    async fn attempts_for_run(&self, run_id: Uuid) -> Result<Vec<Attempt>>;

    /// Appends a snapshot unconditionally. Snapshots are never mutated.
    async fn append_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<()>;

    /// The authoritative latest snapshot for a run.
    async fn latest_snapshot(&self, run_id: Uuid) -> Result<Option<ExecutionSnapshot>>;

    /// Full snapshot history, oldest first.
    async fn snapshots_for_run(&self, run_id: Uuid) -> Result<Vec<ExecutionSnapshot>>;

    async fn insert_waitpoint(&self, waitpoint: &Waitpoint) -> Result<()>;

    async fn get_waitpoint(&self, id: Uuid) -> Result<Option<Waitpoint>>;

    async fn get_waitpoints(&self, ids: &[Uuid]) -> Result<Vec<Waitpoint>>;

    /// Inserts the blocking join row for `(run, waitpoint)`.
    async fn block_run_with_waitpoint(
        &self,
        run_id: Uuid,
        waitpoint_id: Uuid,
        project_id: &str,
    ) -> Result<()>;

    async fn waitpoints_blocking_run(&self, run_id: Uuid) -> Result<Vec<RunWaitpoint>>;

    /// Drops one blocking row; used by the lost-wakeup scanner when a row
    /// outlives its completed waitpoint.
    async fn unblock_run_from_waitpoint(&self, run_id: Uuid, waitpoint_id: Uuid) -> Result<()>;

    /// Drops every blocking row for a run entering a terminal status.
    async fn clear_run_waitpoints(&self, run_id: Uuid) -> Result<()>;

    /// Transactionally completes a waitpoint: marks it COMPLETED with the
    /// given output, deletes its blocking rows, and reports runs left with
    /// no blockers. Returns `None` if the waitpoint was already completed
    /// (idempotent no-op; a completed waitpoint is never reopened).
    async fn complete_waitpoint(
        &self,
        id: Uuid,
        output: Option<String>,
        output_is_error: bool,
    ) -> Result<Option<WaitpointCompletion>>;

    async fn upsert_task_queue(&self, queue: &TaskQueue) -> Result<()>;

    async fn get_task_queue(&self, environment_id: &str, name: &str) -> Result<Option<TaskQueue>>;

    /// Pages through WAITING_TO_RESUME runs older than `cutoff`, for the
    /// lost-wakeup scanner.
    async fn runs_waiting_to_resume_since(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>>;
}
