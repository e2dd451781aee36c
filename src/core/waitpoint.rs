use super::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// How a waitpoint becomes COMPLETED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitpointKind {
    /// Completed when its associated run reaches a terminal status.
    Run,
    /// Completed by the delayed-job worker at `completed_after`.
    DateTime,
    /// Completed by an explicit external call.
    Manual,
}

impl WaitpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitpointKind::Run => "RUN",
            WaitpointKind::DateTime => "DATETIME",
            WaitpointKind::Manual => "MANUAL",
        }
    }
}

impl FromStr for WaitpointKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "RUN" => Ok(WaitpointKind::Run),
            "DATETIME" => Ok(WaitpointKind::DateTime),
            "MANUAL" => Ok(WaitpointKind::Manual),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitpointStatus {
    Pending,
    Completed,
}

impl WaitpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitpointStatus::Pending => "PENDING",
            WaitpointStatus::Completed => "COMPLETED",
        }
    }
}

impl FromStr for WaitpointStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(WaitpointStatus::Pending),
            "COMPLETED" => Ok(WaitpointStatus::Completed),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

/// A completion token a run can block on.
///
/// A COMPLETED waitpoint is terminal: it is never reopened, and completing
/// it again is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waitpoint {
    pub id: Uuid,
    pub project_id: String,
    pub kind: WaitpointKind,
    pub status: WaitpointStatus,
    /// DATETIME waitpoints: when the delayed-job worker should complete it.
    pub completed_after: Option<DateTime<Utc>>,
    /// RUN waitpoints: the run whose terminal completion completes this.
    pub completed_by_run_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
    /// Completion payload: the completing run's output, or its error object.
    pub output: Option<String>,
    pub output_is_error: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Waitpoint {
    pub fn new_run_associated(project_id: impl Into<String>, completed_by_run_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            kind: WaitpointKind::Run,
            status: WaitpointStatus::Pending,
            completed_after: None,
            completed_by_run_id: Some(completed_by_run_id),
            idempotency_key: None,
            output: None,
            output_is_error: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn new_datetime(project_id: impl Into<String>, completed_after: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            kind: WaitpointKind::DateTime,
            status: WaitpointStatus::Pending,
            completed_after: Some(completed_after),
            completed_by_run_id: None,
            idempotency_key: None,
            output: None,
            output_is_error: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn new_manual(project_id: impl Into<String>, idempotency_key: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            kind: WaitpointKind::Manual,
            status: WaitpointStatus::Pending,
            completed_after: None,
            completed_by_run_id: None,
            idempotency_key,
            output: None,
            output_is_error: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == WaitpointStatus::Completed
    }
}

/// Join row: while a `(run, waitpoint)` row exists, the run is blocked by
/// that waitpoint. A run with no rows is unblocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWaitpoint {
    pub run_id: Uuid,
    pub waitpoint_id: Uuid,
    pub project_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waitpoint_kind_conversion() {
        assert_eq!(WaitpointKind::from_str("DATETIME").unwrap(), WaitpointKind::DateTime);
        assert_eq!(WaitpointKind::Run.as_str(), "RUN");
        assert!(WaitpointKind::from_str("TIMER").is_err());
    }

    #[test]
    fn test_run_associated_constructor() {
        let run_id = Uuid::new_v4();
        let w = Waitpoint::new_run_associated("proj_1", run_id);
        assert_eq!(w.kind, WaitpointKind::Run);
        assert_eq!(w.completed_by_run_id, Some(run_id));
        assert!(!w.is_completed());
    }

    #[test]
    fn test_datetime_constructor() {
        let at = Utc::now() + chrono::Duration::seconds(30);
        let w = Waitpoint::new_datetime("proj_1", at);
        assert_eq!(w.kind, WaitpointKind::DateTime);
        assert_eq!(w.completed_after, Some(at));
    }
}
