//! Terminal transitions (finish, cancel, expire, system failure), duration
//! waits, and the delayed-job dispatch.

use super::{EngineError, Result, RunEngine, SnapshotOptions};
use crate::core::{
    serialize_value, ExecutionSnapshot, ExecutionStatus, Run, RunError, RunStatus, Waitpoint,
};
use crate::delayed::{DelayedJob, DelayedJobHandler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl RunEngine {
    /// Shared terminal transition; the caller holds the run's lock.
    ///
    /// Acknowledges the queue entry, clears blocking rows, appends the
    /// FINISHED snapshot and completes the run's associated waitpoint so
    /// blocked parents continue. The waitpoint payload is the run's output
    /// on success and its error object otherwise.
    pub(crate) async fn finish_run(
        &self,
        run: &mut Run,
        status: RunStatus,
        output: Option<String>,
        error: Option<RunError>,
    ) -> Result<ExecutionSnapshot> {
        run.status = status;
        run.output = output.clone();
        run.error = error.clone();
        run.completed_at = Some(Utc::now());
        self.store.update_run(run).await?;

        self.queue.acknowledge_message(run.id).await?;
        self.store.clear_run_waitpoints(run.id).await?;
        if run.ttl_secs.is_some() {
            self.delayed
                .cancel(&DelayedJob::ExpireRun { run_id: run.id }.job_id())
                .await?;
        }

        let snapshot = self
            .append_snapshot(
                run,
                ExecutionStatus::Finished,
                format!("run finished: {status}"),
                SnapshotOptions::default(),
            )
            .await?;

        if let Some(waitpoint_id) = run.associated_waitpoint_id {
            let (payload, is_error) = match (&run.error, &run.output) {
                (Some(error), _) => (Some(serialize_value(error)?), true),
                (None, output) => (output.clone(), false),
            };
            self.complete_waitpoint(waitpoint_id, payload, is_error).await?;
        }
        self.notifier.close_room(run.id);

        info!(run_id = %run.id, status = %status, "run finished");
        Ok(snapshot)
    }

    /// Cancels a run. Idle runs finish as CANCELED immediately; an
    /// executing run gets a PENDING_CANCEL snapshot — the runner observes
    /// it (notify or poll), aborts user code and submits a completion the
    /// engine turns terminal.
    pub async fn cancel(&self, run_id: Uuid) -> Result<ExecutionSnapshot> {
        let lock = self.locks.acquire(run_id).await?;
        let result = self.cancel_locked(run_id).await;
        self.locks.release(lock).await?;
        result
    }

    async fn cancel_locked(&self, run_id: Uuid) -> Result<ExecutionSnapshot> {
        let mut run = self.load_run(run_id).await?;
        let latest = self
            .store
            .latest_snapshot(run_id)
            .await?
            .ok_or(EngineError::NoSnapshot(run_id))?;
        if run.status.is_terminal() {
            return Ok(latest);
        }

        match latest.execution_status {
            ExecutionStatus::Executing
            | ExecutionStatus::ExecutingWithWaitpoints
            | ExecutionStatus::PendingExecuting
            | ExecutionStatus::DequeuedForExecution => {
                let snapshot = self
                    .append_snapshot(
                        &run,
                        ExecutionStatus::PendingCancel,
                        "cancel requested",
                        SnapshotOptions {
                            worker_id: latest.worker_id.clone(),
                            attempt_number: latest.attempt_number,
                            ..SnapshotOptions::default()
                        },
                    )
                    .await?;
                info!(%run_id, "cancel pending runner acknowledgement");
                Ok(snapshot)
            }
            _ => {
                self.finish_run(&mut run, RunStatus::Canceled, None, Some(RunError::aborted()))
                    .await
            }
        }
    }

    /// TTL expiry: only runs that never started an attempt expire.
    pub async fn expire(&self, run_id: Uuid) -> Result<()> {
        let lock = self.locks.acquire(run_id).await?;
        let result = self.expire_locked(run_id).await;
        self.locks.release(lock).await?;
        result
    }

    async fn expire_locked(&self, run_id: Uuid) -> Result<()> {
        let mut run = self.load_run(run_id).await?;
        let latest = self
            .store
            .latest_snapshot(run_id)
            .await?
            .ok_or(EngineError::NoSnapshot(run_id))?;

        if !matches!(
            latest.execution_status,
            ExecutionStatus::RunCreated
                | ExecutionStatus::Queued
                | ExecutionStatus::BlockedByWaitpoints
        ) {
            debug!(%run_id, status = %latest.execution_status, "ttl elapsed but run already started");
            return Ok(());
        }

        let ttl = run.ttl_secs.unwrap_or_default();
        self.finish_run(
            &mut run,
            RunStatus::Expired,
            None,
            Some(RunError::expired(ttl)),
        )
        .await?;
        Ok(())
    }

    /// Unrecoverable internal error: terminal for the run, with the error
    /// retained and propagated through the associated waitpoint.
    pub async fn system_failure(&self, run_id: Uuid, error: RunError) -> Result<()> {
        let lock = self.locks.acquire(run_id).await?;
        let result = async {
            let mut run = self.load_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(());
            }
            self.finish_run(&mut run, RunStatus::SystemFailure, None, Some(error))
                .await?;
            Ok(())
        }
        .await;
        self.locks.release(lock).await?;
        result
    }

    /// Runner-initiated `wait for duration`: creates a datetime waitpoint,
    /// blocks the run on it and returns the handle.
    pub async fn wait_for_duration(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        completed_after: DateTime<Utc>,
    ) -> Result<Waitpoint> {
        let lock = self.locks.acquire(run_id).await?;
        let result = async {
            self.verify_snapshot(run_id, snapshot_id).await?;
            let mut run = self.load_run(run_id).await?;
            let waitpoint = self
                .create_datetime_waitpoint(&run.environment.project_id, completed_after)
                .await?;
            self.block_run_with_waitpoint(&mut run, &waitpoint).await?;
            Ok(waitpoint)
        }
        .await;
        self.locks.release(lock).await?;
        result
    }

    /// Latest snapshot plus run row, for status queries.
    pub async fn run_view(&self, run_id: Uuid) -> Result<(Run, ExecutionSnapshot)> {
        let run = self.load_run(run_id).await?;
        let snapshot = self
            .store
            .latest_snapshot(run_id)
            .await?
            .ok_or(EngineError::NoSnapshot(run_id))?;
        Ok((run, snapshot))
    }

    /// Dispatches one fired delayed job.
    pub async fn handle_delayed_job(&self, job: DelayedJob) -> Result<()> {
        match job {
            DelayedJob::ExpireRun { run_id } => self.expire(run_id).await,
            DelayedJob::CompleteDateTimeWaitpoint { waitpoint_id } => {
                self.complete_waitpoint(waitpoint_id, None, false).await
            }
            DelayedJob::HeartbeatSnapshot {
                run_id,
                snapshot_id,
            } => self.handle_stalled_snapshot(run_id, snapshot_id).await,
        }
    }
}

/// Lets the delayed-job worker feed fired timers back into the engine.
#[async_trait]
impl DelayedJobHandler for RunEngine {
    async fn handle(
        &self,
        job: DelayedJob,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.handle_delayed_job(job).await.map_err(|e| {
            warn!("delayed job failed: {e}");
            Box::new(e) as Box<dyn std::error::Error + Send + Sync>
        })
    }
}

/// Convenience: wire a [`crate::delayed::DelayedJobWorker`] to an engine.
pub fn delayed_job_worker(
    engine: Arc<RunEngine>,
    queue: Arc<dyn crate::delayed::DelayedJobQueue>,
) -> crate::delayed::DelayedJobWorker {
    crate::delayed::DelayedJobWorker::new(queue, engine)
}
