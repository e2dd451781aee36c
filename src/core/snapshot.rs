use super::error::Error;
use super::run::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Where a run currently is in its execution lifecycle.
///
/// Only the latest snapshot's status is authoritative; everything older is
/// immutable audit history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    RunCreated,
    Queued,
    DequeuedForExecution,
    Executing,
    /// Executing, but waitpoints were attached mid-attempt; the runner may
    /// request suspension.
    ExecutingWithWaitpoints,
    BlockedByWaitpoints,
    /// Waitpoints completed while suspended with a live worker; the runner
    /// should call continue.
    PendingExecuting,
    PendingCancel,
    Suspended,
    Finished,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::RunCreated => "RUN_CREATED",
            ExecutionStatus::Queued => "QUEUED",
            ExecutionStatus::DequeuedForExecution => "DEQUEUED_FOR_EXECUTION",
            ExecutionStatus::Executing => "EXECUTING",
            ExecutionStatus::ExecutingWithWaitpoints => "EXECUTING_WITH_WAITPOINTS",
            ExecutionStatus::BlockedByWaitpoints => "BLOCKED_BY_WAITPOINTS",
            ExecutionStatus::PendingExecuting => "PENDING_EXECUTING",
            ExecutionStatus::PendingCancel => "PENDING_CANCEL",
            ExecutionStatus::Suspended => "SUSPENDED",
            ExecutionStatus::Finished => "FINISHED",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "RUN_CREATED" => Ok(ExecutionStatus::RunCreated),
            "QUEUED" => Ok(ExecutionStatus::Queued),
            "DEQUEUED_FOR_EXECUTION" => Ok(ExecutionStatus::DequeuedForExecution),
            "EXECUTING" => Ok(ExecutionStatus::Executing),
            "EXECUTING_WITH_WAITPOINTS" => Ok(ExecutionStatus::ExecutingWithWaitpoints),
            "BLOCKED_BY_WAITPOINTS" => Ok(ExecutionStatus::BlockedByWaitpoints),
            "PENDING_EXECUTING" => Ok(ExecutionStatus::PendingExecuting),
            "PENDING_CANCEL" => Ok(ExecutionStatus::PendingCancel),
            "SUSPENDED" => Ok(ExecutionStatus::Suspended),
            "FINISHED" => Ok(ExecutionStatus::Finished),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

/// An immutable record of a run's execution status at a point in time.
///
/// Snapshots are append-only: created only by the run engine, never mutated,
/// never deleted. Stall-check timers capture a snapshot id and compare it
/// with the latest on fire; an id mismatch means the run has moved on and
/// the timer is stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub id: Uuid,
    pub run_id: Uuid,
    pub execution_status: ExecutionStatus,
    /// The run's status at the time this snapshot was taken.
    pub run_status: RunStatus,
    /// Runner process currently attached to the run, if any.
    pub worker_id: Option<String>,
    pub attempt_number: Option<u32>,
    /// Waitpoints whose completion produced this snapshot; their outputs are
    /// delivered to the runner on resume.
    pub completed_waitpoint_ids: Vec<Uuid>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    pub fn new(
        run_id: Uuid,
        execution_status: ExecutionStatus,
        run_status: RunStatus,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            execution_status,
            run_status,
            worker_id: None,
            attempt_number: None,
            completed_waitpoint_ids: Vec::new(),
            description: description.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_attempt_number(mut self, number: u32) -> Self {
        self.attempt_number = Some(number);
        self
    }

    pub fn with_completed_waitpoints(mut self, ids: Vec<Uuid>) -> Self {
        self.completed_waitpoint_ids = ids;
        self
    }
}
