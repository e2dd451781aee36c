use super::error::{Error, RunError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Deployment class of an environment.
///
/// DEVELOPMENT environments get their own isolated master queue; all other
/// types share the deployed master queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvironmentType {
    Production,
    Staging,
    Preview,
    Development,
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Production => "PRODUCTION",
            EnvironmentType::Staging => "STAGING",
            EnvironmentType::Preview => "PREVIEW",
            EnvironmentType::Development => "DEVELOPMENT",
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(self, EnvironmentType::Development)
    }
}

impl FromStr for EnvironmentType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PRODUCTION" => Ok(EnvironmentType::Production),
            "STAGING" => Ok(EnvironmentType::Staging),
            "PREVIEW" => Ok(EnvironmentType::Preview),
            "DEVELOPMENT" => Ok(EnvironmentType::Development),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

/// Tenant coordinates of a run: which org/project/environment owns it.
///
/// These four values are embedded into every queue key, so the queue can
/// recover a run's tenant from the key alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunEnvironment {
    pub organization_id: String,
    pub project_id: String,
    pub environment_id: String,
    pub environment_type: EnvironmentType,
}

impl RunEnvironment {
    pub fn new(
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
        environment_id: impl Into<String>,
        environment_type: EnvironmentType,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            project_id: project_id.into(),
            environment_id: environment_id.into(),
            environment_type,
        }
    }
}

/// Lifecycle status of a run.
///
/// A run's status transitions only via the run engine; every terminal status
/// is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Waiting in a queue (or about to be enqueued).
    Pending,
    /// Trigger carried `delay_until`; not yet enqueued.
    Delayed,
    /// An attempt is currently running.
    Executing,
    /// Blocked on one or more waitpoints.
    WaitingToResume,
    /// Final: last attempt returned ok.
    CompletedSuccessfully,
    /// Final: user code failed and no retries remain.
    CompletedWithErrors,
    /// Final: the engine hit an internal error for this run.
    SystemFailure,
    /// Final: the runner died and no retries remain.
    Crashed,
    /// Final: ttl elapsed before the run was dequeued.
    Expired,
    /// Final: canceled by a user.
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Delayed => "DELAYED",
            RunStatus::Executing => "EXECUTING",
            RunStatus::WaitingToResume => "WAITING_TO_RESUME",
            RunStatus::CompletedSuccessfully => "COMPLETED_SUCCESSFULLY",
            RunStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            RunStatus::SystemFailure => "SYSTEM_FAILURE",
            RunStatus::Crashed => "CRASHED",
            RunStatus::Expired => "EXPIRED",
            RunStatus::Canceled => "CANCELED",
        }
    }

    /// True for statuses no transition can leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::CompletedSuccessfully
                | RunStatus::CompletedWithErrors
                | RunStatus::SystemFailure
                | RunStatus::Crashed
                | RunStatus::Expired
                | RunStatus::Canceled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RunStatus::Pending),
            "DELAYED" => Ok(RunStatus::Delayed),
            "EXECUTING" => Ok(RunStatus::Executing),
            "WAITING_TO_RESUME" => Ok(RunStatus::WaitingToResume),
            "COMPLETED_SUCCESSFULLY" => Ok(RunStatus::CompletedSuccessfully),
            "COMPLETED_WITH_ERRORS" => Ok(RunStatus::CompletedWithErrors),
            "SYSTEM_FAILURE" => Ok(RunStatus::SystemFailure),
            "CRASHED" => Ok(RunStatus::Crashed),
            "EXPIRED" => Ok(RunStatus::Expired),
            "CANCELED" => Ok(RunStatus::Canceled),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

/// A single invocation of a task with a given payload.
///
/// Created by `trigger`, mutated only by the run engine. The row carries
/// everything needed to (re)build the run's queue message, so a blocked run
/// can re-enqueue without the original trigger request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub friendly_id: String,
    pub task_identifier: String,
    /// Serialized payload (JSON text) plus its declared content type.
    pub payload: String,
    pub payload_type: String,
    pub status: RunStatus,
    pub environment: RunEnvironment,
    pub queue_name: String,
    pub master_queue: String,
    pub concurrency_key: Option<String>,
    pub idempotency_key: Option<String>,
    pub max_attempts: u32,
    pub attempt_count: u32,
    /// Seconds the run may sit queued before expiring.
    pub ttl_secs: Option<u64>,
    pub delay_until: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub parent_run_id: Option<Uuid>,
    pub root_run_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub depth: u32,
    pub resume_parent_on_completion: bool,
    /// The run-type waitpoint that completes when this run reaches a
    /// terminal status. Set once at trigger time.
    pub associated_waitpoint_id: Option<Uuid>,
    pub output: Option<String>,
    pub error: Option<RunError>,
    /// Opaque trace propagation payload (W3C traceparent or similar).
    pub trace_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Generates a `run_<hex>` friendly id from the run's uuid.
pub fn friendly_run_id(id: Uuid) -> String {
    format!("run_{}", id.simple())
}

/// One execution try of a run.
///
/// A run may have several attempts on retry; `number` is 1-based and
/// monotonic per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub run_id: Uuid,
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<RunError>,
}

/// Whether a queue row was declared by the user (NAMED) or materialized on
/// first use (VIRTUAL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskQueueType {
    Named,
    Virtual,
}

impl TaskQueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskQueueType::Named => "NAMED",
            TaskQueueType::Virtual => "VIRTUAL",
        }
    }
}

impl FromStr for TaskQueueType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "NAMED" => Ok(TaskQueueType::Named),
            "VIRTUAL" => Ok(TaskQueueType::Virtual),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

/// Per-environment queue declaration.
///
/// `concurrency_limit = None` inherits the environment limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueue {
    pub environment_id: String,
    pub name: String,
    pub concurrency_limit: Option<u32>,
    pub queue_type: TaskQueueType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_conversion() {
        assert_eq!(RunStatus::WaitingToResume.as_str(), "WAITING_TO_RESUME");
        assert_eq!(
            RunStatus::from_str("WAITING_TO_RESUME").unwrap(),
            RunStatus::WaitingToResume
        );
        assert_eq!(
            RunStatus::from_str("COMPLETED_WITH_ERRORS").unwrap(),
            RunStatus::CompletedWithErrors
        );
        assert!(RunStatus::from_str("NOT_A_STATUS").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::WaitingToResume.is_terminal());
        assert!(RunStatus::Expired.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(RunStatus::CompletedSuccessfully.is_terminal());
    }

    #[test]
    fn test_friendly_run_id() {
        let id = Uuid::new_v4();
        let friendly = friendly_run_id(id);
        assert!(friendly.starts_with("run_"));
        assert_eq!(friendly.len(), 4 + 32);
    }

    #[test]
    fn test_environment_type_master_queue_isolation() {
        assert!(EnvironmentType::Development.is_development());
        assert!(!EnvironmentType::Production.is_development());
        assert_eq!(
            EnvironmentType::from_str("STAGING").unwrap(),
            EnvironmentType::Staging
        );
    }
}
