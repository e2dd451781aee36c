//! Durable timer queue for the engine's delayed jobs.
//!
//! Three job kinds flow through here: run TTL expiry, datetime-waitpoint
//! completion, and snapshot stall-checks. Job ids are deterministic
//! (`heartbeatSnapshot.{snapshot_id}` and friends), so scheduling the same
//! job twice collapses to one timer — re-scheduling just moves it.
//!
//! Delivery is at-least-once with a visibility timeout: a claimed job that
//! is neither acked nor nacked becomes claimable again after the timeout.
//!
//! # Backends
//!
//! - [`RedisDelayedJobQueue`]: pending/claimed ZSETs scored by timestamp.
//! - [`InMemoryDelayedJobQueue`]: the same shape on process-local state.

mod memory;
#[cfg(feature = "redis")]
mod redis;
mod worker;

pub use memory::InMemoryDelayedJobQueue;
#[cfg(feature = "redis")]
pub use redis::RedisDelayedJobQueue;
pub use worker::{DelayedJobHandler, DelayedJobWorker, DelayedJobWorkerHandle};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Delayed-job layer error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DelayedJobError {
    /// A connection or script error from the backing store.
    #[error("connection error: {0}")]
    Connection(String),

    /// A core serialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] crate::core::Error),
}

pub type Result<T> = std::result::Result<T, DelayedJobError>;

/// Default visibility timeout for claimed jobs.
pub const DEFAULT_VISIBILITY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// A durable timer owned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DelayedJob {
    /// Fire `expire(run_id)` when the run's ttl elapses.
    ExpireRun { run_id: Uuid },
    /// Complete a DATETIME waitpoint at its `completed_after`.
    CompleteDateTimeWaitpoint { waitpoint_id: Uuid },
    /// Stall-check: verify the snapshot is still the latest for the run.
    HeartbeatSnapshot { run_id: Uuid, snapshot_id: Uuid },
}

impl DelayedJob {
    /// Deterministic id: duplicate scheduling of the same logical timer
    /// collapses onto one entry.
    pub fn job_id(&self) -> String {
        match self {
            DelayedJob::ExpireRun { run_id } => format!("expireRun.{run_id}"),
            DelayedJob::CompleteDateTimeWaitpoint { waitpoint_id } => {
                format!("waitpointCompleteDateTime.{waitpoint_id}")
            }
            DelayedJob::HeartbeatSnapshot { snapshot_id, .. } => {
                format!("heartbeatSnapshot.{snapshot_id}")
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DelayedJob::ExpireRun { .. } => "expireRun",
            DelayedJob::CompleteDateTimeWaitpoint { .. } => "waitpointCompleteDateTime",
            DelayedJob::HeartbeatSnapshot { .. } => "heartbeatSnapshot",
        }
    }
}

/// A claimed job handed to the worker loop.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: DelayedJob,
    pub job_id: String,
}

/// Durable timer queue operations.
#[async_trait]
pub trait DelayedJobQueue: Send + Sync {
    /// Schedules (or re-schedules) a job to become claimable at
    /// `available_at`.
    async fn enqueue(&self, job: DelayedJob, available_at: DateTime<Utc>) -> Result<()>;

    /// Removes a pending job; a no-op if it was already claimed or acked.
    async fn cancel(&self, job_id: &str) -> Result<()>;

    /// Atomically claims up to `limit` ready jobs, making each invisible
    /// for the visibility timeout. Also reclaims jobs whose previous claim
    /// timed out.
    async fn claim_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ClaimedJob>>;

    /// Permanently removes a claimed job.
    async fn ack(&self, job_id: &str) -> Result<()>;

    /// Returns a claimed job to the pending queue at `retry_at`.
    async fn nack(&self, job_id: &str, retry_at: DateTime<Utc>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_deterministic() {
        let snapshot_id = Uuid::new_v4();
        let a = DelayedJob::HeartbeatSnapshot {
            run_id: Uuid::new_v4(),
            snapshot_id,
        };
        let b = DelayedJob::HeartbeatSnapshot {
            run_id: Uuid::new_v4(),
            snapshot_id,
        };
        // Same snapshot → same timer, regardless of the run handle.
        assert_eq!(a.job_id(), b.job_id());
        assert!(a.job_id().starts_with("heartbeatSnapshot."));
    }

    #[test]
    fn test_job_roundtrip() {
        let job = DelayedJob::ExpireRun {
            run_id: Uuid::new_v4(),
        };
        let json = serde_json::to_string(&job).unwrap();
        let back: DelayedJob = serde_json::from_str(&json).unwrap();
        assert_eq!(job, back);
    }
}
