//! Fair, weighted, multi-tenant run queue with concurrency enforcement.
//!
//! The queue is a two-level structure: a *master queue* (sorted set of
//! member queue keys) per deployment or per dev environment, and one sorted
//! set of run ids per `(org, project, envType, env, queue[, ck])`. Message
//! bodies are stored by reference under `message:{run_id}` so a blocked run
//! can release its concurrency without losing its payload.
//!
//! Dequeue picks an environment, then a queue within it, using the weighted
//! [`PriorityStrategy`]; the *claim* (limit re-check, pop, counter
//! increments, in-flight record) is atomic in every backend, so current
//! concurrency can never exceed a limit at the moment a dequeue returns.
//!
//! # Backends
//!
//! - [`RedisRunQueue`]: production backend; claims run as Lua scripts.
//! - [`InMemoryRunQueue`]: same semantics on process-local state, for tests
//!   and embedded use.

mod keys;
mod memory;
mod priority;
#[cfg(feature = "redis")]
mod redis;

pub use keys::{KeyProducer, QueueDescriptor};
pub use memory::InMemoryRunQueue;
pub use priority::{PriorityStrategy, DEFAULT_ENV_CANDIDATES, DEFAULT_QUEUE_CANDIDATES};
#[cfg(feature = "redis")]
pub use redis::RedisRunQueue;

use crate::core::{RunEnvironment, RunMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Queue layer error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// A connection or script error from the backing store.
    #[error("connection error: {0}")]
    Connection(String),

    /// A core serialization or key error occurred.
    #[error("core error: {0}")]
    Core(#[from] crate::core::Error),

    /// No message body exists for the given run.
    #[error("message not found: run={0}")]
    MessageNotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Tuning knobs shared by the queue backends.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Key prefix for every queue construct.
    pub prefix: String,
    /// Environment concurrency cap applied when no explicit limit is set.
    pub default_env_concurrency_limit: u32,
    /// How many member queues to pull from the master queue per dequeue.
    pub master_scan_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: "drover:".to_string(),
            default_env_concurrency_limit: 100,
            master_scan_limit: 128,
        }
    }
}

impl QueueConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_default_env_concurrency_limit(mut self, limit: u32) -> Self {
        self.default_env_concurrency_limit = limit;
        self
    }
}

/// The run queue operations the engine depends on.
///
/// Counter semantics: `dequeue` increments the queue, environment and
/// task-identifier currentConcurrency sets together; `acknowledge`,
/// `nack` and `release_concurrency` remove the run from all three.
/// All removal operations are idempotent — removing an absent member never
/// double-decrements.
#[async_trait]
pub trait RunQueue: Send + Sync {
    /// Writes the message body and inserts the run into its queue with
    /// score `available_at`, publishing master-queue membership.
    ///
    /// Re-enqueueing an id that is already present replaces its score and
    /// body, so a run can never occupy two queue positions.
    async fn enqueue_message(
        &self,
        env: &RunEnvironment,
        master_queue: &str,
        message: RunMessage,
    ) -> Result<()>;

    /// Two-level weighted dequeue from a master queue.
    ///
    /// Returns `None` when no candidate passes its concurrency gates.
    async fn dequeue_message_in_shared_queue(
        &self,
        consumer_id: &str,
        master_queue: &str,
    ) -> Result<Option<RunMessage>>;

    /// Drops the run's concurrency, its in-flight record and its message
    /// body. Idempotent.
    async fn acknowledge_message(&self, run_id: Uuid) -> Result<()>;

    /// Drops the run's concurrency and re-inserts it into its queue with
    /// score `retry_at` (defaults to now). Idempotent.
    async fn nack_message(&self, run_id: Uuid, retry_at: Option<DateTime<Utc>>) -> Result<()>;

    /// Drops the run's concurrency and in-flight record but keeps the
    /// message body, for a run entering a blocked state.
    async fn release_concurrency(&self, run_id: Uuid) -> Result<()>;

    /// Attempts to re-take the concurrency released at suspension.
    ///
    /// Returns `false` if any limit would be exceeded, signalling the
    /// caller to re-queue instead.
    async fn reacquire_concurrency(&self, run_id: Uuid) -> Result<bool>;

    async fn update_queue_concurrency_limits(
        &self,
        env: &RunEnvironment,
        queue: &str,
        limit: u32,
    ) -> Result<()>;

    async fn remove_queue_concurrency_limits(
        &self,
        env: &RunEnvironment,
        queue: &str,
    ) -> Result<()>;

    async fn update_env_concurrency_limits(&self, env: &RunEnvironment, limit: u32) -> Result<()>;

    /// Reads a stored message body without consuming it.
    async fn read_message(&self, run_id: Uuid) -> Result<Option<RunMessage>>;

    /// Number of queued (not in-flight) runs in one queue.
    async fn queue_length(
        &self,
        env: &RunEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> Result<usize>;

    /// Size of a queue's currentConcurrency set.
    async fn current_concurrency(
        &self,
        env: &RunEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> Result<usize>;
}

pub(crate) fn ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}
