use super::run::{EnvironmentType, RunEnvironment};
use super::snapshot::ExecutionSnapshot;
use super::waitpoint::WaitpointKind;
use super::RunError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Queue element for one run.
///
/// Queue sorted sets hold only run ids ordered by score; this body lives
/// under its own key (`message:{run_id}`) and survives suspension, so a
/// blocked run re-enqueues without rebuilding the message from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMessage {
    pub run_id: Uuid,
    pub task_identifier: String,
    pub organization_id: String,
    pub project_id: String,
    pub environment_id: String,
    pub environment_type: EnvironmentType,
    pub queue_name: String,
    pub concurrency_key: Option<String>,
    /// Master-queue key this run was published under; used to maintain
    /// master membership on nack/ack without re-deriving it.
    pub master_queue: String,
    pub enqueued_at: DateTime<Utc>,
    /// Queue score: the message is invisible to dequeuers before this.
    pub available_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl RunMessage {
    pub fn environment(&self) -> RunEnvironment {
        RunEnvironment {
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            environment_id: self.environment_id.clone(),
            environment_type: self.environment_type,
        }
    }
}

/// What a supervisor hands to a runner after a successful dequeue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DequeuedMessage {
    pub message: RunMessage,
    /// Latest snapshot id at dequeue time; every subsequent protocol call
    /// must echo it back.
    pub snapshot_id: Uuid,
    pub run_friendly_id: String,
}

/// A waitpoint completion delivered to the runner on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedWaitpoint {
    pub id: Uuid,
    pub kind: WaitpointKind,
    pub output: Option<String>,
    pub output_is_error: bool,
}

/// Everything a runner needs to start executing an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptExecution {
    pub run_id: Uuid,
    pub run_friendly_id: String,
    pub task_identifier: String,
    pub payload: String,
    pub payload_type: String,
    pub attempt_id: Uuid,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub snapshot_id: Uuid,
    pub environment_variables: std::collections::HashMap<String, String>,
    pub completed_waitpoints: Vec<CompletedWaitpoint>,
}

/// Result a runner submits when an attempt finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptCompletion {
    pub ok: bool,
    pub output: Option<String>,
    pub error: Option<RunError>,
    /// Requested retry delay, if user code asked for a retry.
    pub retry_delay: Option<Duration>,
}

impl AttemptCompletion {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: Some(output.into()),
            error: None,
            retry_delay: None,
        }
    }

    pub fn failed(error: RunError) -> Self {
        Self {
            ok: false,
            output: None,
            error: Some(error),
            retry_delay: None,
        }
    }

    pub fn failed_with_retry(error: RunError, delay: Duration) -> Self {
        Self {
            ok: false,
            output: None,
            error: Some(error),
            retry_delay: Some(delay),
        }
    }
}

/// The engine's verdict on a submitted completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    /// The run is done (successfully or not); the runner goes to warm start.
    RunFinished,
    /// A cancel arrived before the completion; treat the run as canceling.
    RunPendingCancel,
    /// Retry re-enqueued with a delay; the runner goes to warm start.
    RetryQueued,
    /// Short-delay retry: the runner sleeps and starts the next attempt
    /// itself, keeping the process warm.
    RetryImmediately,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::RunFinished => "RUN_FINISHED",
            AttemptStatus::RunPendingCancel => "RUN_PENDING_CANCEL",
            AttemptStatus::RetryQueued => "RETRY_QUEUED",
            AttemptStatus::RetryImmediately => "RETRY_IMMEDIATELY",
        }
    }
}

/// Response to a completion submission: the verdict plus the snapshot the
/// verdict produced (and the retry delay for RETRY_IMMEDIATELY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteAttemptResult {
    pub attempt_status: AttemptStatus,
    pub snapshot: ExecutionSnapshot,
    pub retry_delay: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::RunErrorCode;

    #[test]
    fn test_message_roundtrip() {
        let msg = RunMessage {
            run_id: Uuid::new_v4(),
            task_identifier: "send-email".into(),
            organization_id: "org_1".into(),
            project_id: "proj_1".into(),
            environment_id: "env_1".into(),
            environment_type: EnvironmentType::Production,
            queue_name: "default".into(),
            concurrency_key: Some("user-42".into()),
            master_queue: "drover:sharedQueue".into(),
            enqueued_at: Utc::now(),
            available_at: Utc::now(),
            attempt_count: 0,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: RunMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_completion_constructors() {
        let ok = AttemptCompletion::succeeded("\"hi\"");
        assert!(ok.ok);
        assert!(ok.error.is_none());

        let err = AttemptCompletion::failed_with_retry(
            RunError::new(RunErrorCode::TaskRunFailed, "flaky"),
            Duration::from_secs(10),
        );
        assert!(!err.ok);
        assert_eq!(err.retry_delay, Some(Duration::from_secs(10)));
    }
}
