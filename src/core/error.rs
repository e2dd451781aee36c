use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Core error type for the drover run engine.
///
/// This error type uses `thiserror` with proper `#[source]` annotations
/// to preserve error chains for debugging and error handling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Serialization failed when encoding a value to JSON.
    #[error("serialization failed")]
    Serialization(#[source] serde_json::Error),

    /// Deserialization failed when decoding JSON to a value.
    #[error("deserialization failed")]
    Deserialization(#[source] serde_json::Error),

    /// An invalid status string was encountered during parsing.
    #[error("invalid status: {0}")]
    InvalidStatus(String),

    /// A queue key did not match the canonical key layout.
    #[error("invalid queue key: {0}")]
    InvalidQueueKey(String),

    /// The requested run was not found.
    #[error("run not found: id={0}")]
    RunNotFound(Uuid),

    /// The requested waitpoint was not found.
    #[error("waitpoint not found: id={0}")]
    WaitpointNotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable codes for run-level failures.
///
/// Each terminal failure carries one of these so callers can branch on the
/// failure class without string matching. The wire representation is the
/// SCREAMING_SNAKE string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunErrorCode {
    /// User code returned an error and no retries remain.
    TaskRunFailed,
    /// The run exceeded its `ttl` before being dequeued.
    TaskRunExpired,
    /// The run was canceled while in flight.
    TaskRunAborted,
    /// The runner stopped heartbeating and the attempt was presumed dead.
    TaskRunStalledExecuting,
    /// A run reached an engine operation without any execution snapshot.
    TaskHasNoExecutionSnapshot,
    /// The engine hit an unexpected condition while handling another error.
    HandleErrorError,
    /// Catch-all for unexpected internal engine failures.
    TaskRunInternalError,
}

impl RunErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunErrorCode::TaskRunFailed => "TASK_RUN_FAILED",
            RunErrorCode::TaskRunExpired => "TASK_RUN_EXPIRED",
            RunErrorCode::TaskRunAborted => "TASK_RUN_ABORTED",
            RunErrorCode::TaskRunStalledExecuting => "TASK_RUN_STALLED_EXECUTING",
            RunErrorCode::TaskHasNoExecutionSnapshot => "TASK_HAS_NO_EXECUTION_SNAPSHOT",
            RunErrorCode::HandleErrorError => "HANDLE_ERROR_ERROR",
            RunErrorCode::TaskRunInternalError => "TASK_RUN_INTERNAL_ERROR",
        }
    }
}

/// Structured error retained on a terminally-failed run.
///
/// This is the user-visible failure object: it survives on the run row and
/// is delivered as the completion payload of the run's associated waitpoint,
/// so parents blocked on the run observe the same error the dashboard shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub code: RunErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RunError {
    pub fn new(code: RunErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Error recorded when a run expires before ever being dequeued.
    pub fn expired(ttl_secs: u64) -> Self {
        Self::new(
            RunErrorCode::TaskRunExpired,
            format!("run expired: not dequeued within ttl of {ttl_secs}s"),
        )
    }

    /// Error recorded when a heartbeat stall kills an executing attempt.
    pub fn stalled() -> Self {
        Self::new(
            RunErrorCode::TaskRunStalledExecuting,
            "attempt stopped heartbeating and was presumed crashed",
        )
    }

    /// Error recorded when a run is canceled while in flight.
    pub fn aborted() -> Self {
        Self::new(RunErrorCode::TaskRunAborted, "run was canceled")
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_error_code_strings() {
        assert_eq!(RunErrorCode::TaskRunExpired.as_str(), "TASK_RUN_EXPIRED");
        assert_eq!(
            RunErrorCode::TaskHasNoExecutionSnapshot.as_str(),
            "TASK_HAS_NO_EXECUTION_SNAPSHOT"
        );
    }

    #[test]
    fn test_run_error_roundtrip() {
        let err = RunError::new(RunErrorCode::TaskRunFailed, "boom").with_stack("at task.rs:1");
        let json = serde_json::to_string(&err).unwrap();
        let back: RunError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
