//! Attempt lifecycle: start, heartbeat, completion and the retry decision.

use super::{EngineError, Result, RunEngine, SnapshotOptions};
use crate::core::{
    AttemptCompletion, AttemptExecution, AttemptStatus, CompleteAttemptResult, ExecutionSnapshot,
    ExecutionStatus, Run, RunError, RunErrorCode, RunStatus,
};
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

impl RunEngine {
    /// Starts an attempt for a dequeued run.
    ///
    /// `snapshot_id` must be the latest snapshot (409 otherwise). Creates
    /// the attempt row, transitions to EXECUTING and returns everything the
    /// runner needs, including payloads of waitpoints completed while the
    /// run sat queued.
    pub async fn start_attempt(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        worker_id: &str,
        is_warm_start: bool,
    ) -> Result<AttemptExecution> {
        let lock = self.locks.acquire(run_id).await?;
        let result = self
            .start_attempt_locked(run_id, snapshot_id, worker_id, is_warm_start)
            .await;
        self.locks.release(lock).await?;
        result
    }

    async fn start_attempt_locked(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        worker_id: &str,
        is_warm_start: bool,
    ) -> Result<AttemptExecution> {
        let latest = self.verify_snapshot(run_id, snapshot_id).await?;
        let mut run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::RunIsTerminal {
                run_id,
                status: run.status,
            });
        }

        let attempt = self.store.create_attempt(run_id).await?;
        run.attempt_count = attempt.number;
        run.status = RunStatus::Executing;
        self.store.update_run(&run).await?;

        let snapshot = self
            .append_snapshot(
                &run,
                ExecutionStatus::Executing,
                format!(
                    "attempt {} started{}",
                    attempt.number,
                    if is_warm_start { " (warm)" } else { "" }
                ),
                SnapshotOptions {
                    worker_id: Some(worker_id.to_string()),
                    attempt_number: Some(attempt.number),
                    completed_waitpoint_ids: latest.completed_waitpoint_ids.clone(),
                },
            )
            .await?;

        let completed_waitpoints = self.completed_waitpoints_for(&snapshot).await?;
        info!(
            %run_id,
            attempt = attempt.number,
            worker_id,
            warm_start = is_warm_start,
            "attempt started"
        );

        Ok(AttemptExecution {
            run_id: run.id,
            run_friendly_id: run.friendly_id.clone(),
            task_identifier: run.task_identifier.clone(),
            payload: run.payload.clone(),
            payload_type: run.payload_type.clone(),
            attempt_id: attempt.id,
            attempt_number: attempt.number,
            max_attempts: run.max_attempts,
            snapshot_id: snapshot.id,
            environment_variables: self.environment_variables(&run),
            completed_waitpoints,
        })
    }

    /// Extends the stall-check timer for a live attempt.
    ///
    /// A mismatched snapshot id means the run moved on without the runner;
    /// surfaced as 409 so the runner re-syncs (or abandons the attempt).
    pub async fn heartbeat(&self, run_id: Uuid, snapshot_id: Uuid) -> Result<ExecutionSnapshot> {
        let latest = self.verify_snapshot(run_id, snapshot_id).await?;
        let interval = self
            .config
            .stall_timeouts
            .interval_for(latest.execution_status);
        self.delayed
            .enqueue(
                crate::delayed::DelayedJob::HeartbeatSnapshot {
                    run_id,
                    snapshot_id: latest.id,
                },
                Utc::now() + ChronoDuration::milliseconds(interval.as_millis() as i64),
            )
            .await?;
        debug!(%run_id, %snapshot_id, "heartbeat");
        Ok(latest)
    }

    /// Accepts an attempt's result and decides what happens next:
    /// terminal completion, queued retry, or an in-place immediate retry.
    pub async fn complete_attempt(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        completion: AttemptCompletion,
    ) -> Result<CompleteAttemptResult> {
        let lock = self.locks.acquire(run_id).await?;
        let result = self
            .complete_attempt_locked(run_id, snapshot_id, completion)
            .await;
        self.locks.release(lock).await?;
        result
    }

    async fn complete_attempt_locked(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        completion: AttemptCompletion,
    ) -> Result<CompleteAttemptResult> {
        let latest = self.verify_snapshot(run_id, snapshot_id).await?;
        let mut run = self.load_run(run_id).await?;

        // A cancel raced the completion: the attempt result is discarded
        // and the run finishes as CANCELED.
        if latest.execution_status == ExecutionStatus::PendingCancel {
            let snapshot = self
                .finish_run(&mut run, RunStatus::Canceled, None, Some(RunError::aborted()))
                .await?;
            return Ok(CompleteAttemptResult {
                attempt_status: AttemptStatus::RunPendingCancel,
                snapshot,
                retry_delay: None,
            });
        }

        let attempt_id = self.current_attempt_id(&run).await?;

        if completion.ok {
            if let Some(attempt_id) = attempt_id {
                self.store.finalize_attempt(attempt_id, None).await?;
            }
            let snapshot = self
                .finish_run(
                    &mut run,
                    RunStatus::CompletedSuccessfully,
                    completion.output,
                    None,
                )
                .await?;
            return Ok(CompleteAttemptResult {
                attempt_status: AttemptStatus::RunFinished,
                snapshot,
                retry_delay: None,
            });
        }

        let error = completion
            .error
            .unwrap_or_else(|| RunError::new(RunErrorCode::TaskRunFailed, "task failed"));
        if let Some(attempt_id) = attempt_id {
            self.store
                .finalize_attempt(attempt_id, Some(error.clone()))
                .await?;
        }

        let retryable = completion.retry_delay.is_some() && run.attempt_count < run.max_attempts;
        if !retryable {
            let snapshot = self
                .finish_run(&mut run, RunStatus::CompletedWithErrors, None, Some(error))
                .await?;
            return Ok(CompleteAttemptResult {
                attempt_status: AttemptStatus::RunFinished,
                snapshot,
                retry_delay: None,
            });
        }

        let delay = completion.retry_delay.unwrap_or_default();
        if delay < self.config.retry_immediately_threshold {
            // The runner sleeps through the delay itself and starts the
            // next attempt against this snapshot, staying warm.
            let snapshot = self
                .append_snapshot(
                    &run,
                    ExecutionStatus::Executing,
                    format!(
                        "attempt {} failed, retrying immediately in {:?}",
                        run.attempt_count, delay
                    ),
                    SnapshotOptions {
                        worker_id: latest.worker_id.clone(),
                        attempt_number: latest.attempt_number,
                        ..SnapshotOptions::default()
                    },
                )
                .await?;
            info!(%run_id, attempt = run.attempt_count, ?delay, "retry immediately");
            return Ok(CompleteAttemptResult {
                attempt_status: AttemptStatus::RetryImmediately,
                snapshot,
                retry_delay: Some(delay),
            });
        }

        // Queued retry: give the slot back and resurface after the delay.
        run.status = RunStatus::Pending;
        self.store.update_run(&run).await?;
        self.queue
            .nack_message(
                run_id,
                Some(Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64)),
            )
            .await?;
        let snapshot = self
            .append_snapshot(
                &run,
                ExecutionStatus::Queued,
                format!(
                    "attempt {} failed, retry queued in {:?}",
                    run.attempt_count, delay
                ),
                SnapshotOptions::default(),
            )
            .await?;
        info!(%run_id, attempt = run.attempt_count, ?delay, "retry queued");
        Ok(CompleteAttemptResult {
            attempt_status: AttemptStatus::RetryQueued,
            snapshot,
            retry_delay: Some(delay),
        })
    }

    async fn current_attempt_id(&self, run: &Run) -> Result<Option<Uuid>> {
        Ok(self
            .store
            .attempts_for_run(run.id)
            .await?
            .into_iter()
            .find(|a| a.number == run.attempt_count)
            .map(|a| a.id))
    }
}
