//! Waitpoint management: creating and completing waitpoints, blocking and
//! unblocking runs, and the lost-wakeup scanner.
//!
//! Invariant maintained here: once a run has started its queue lifecycle,
//! `status == WAITING_TO_RESUME ⇔ a RunWaitpoint row exists`. Two bounded
//! exceptions: a DELAYED run blocked on its trigger-time datetime waitpoint
//! keeps DELAYED until the delay elapses, and the PENDING_EXECUTING handoff
//! window (rows gone, runner not yet continued) is covered by its own
//! stall-check. `continue_run` is the only mechanism that moves a run out
//! of the blocked state.

use super::{EngineError, Result, RunEngine, SnapshotOptions};
use crate::core::{
    ExecutionSnapshot, ExecutionStatus, Run, RunStatus, Waitpoint, WaitpointStatus,
};
use crate::delayed::DelayedJob;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Response to a runner's suspension request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendOutcome {
    /// False when the platform declined (the waitpoints already completed);
    /// the runner stays alive and waits for the next change.
    pub suspended: bool,
    pub snapshot: ExecutionSnapshot,
}

impl RunEngine {
    /// Creates the RUN-type waitpoint that completes when `run` reaches a
    /// terminal status. Created alongside every new run.
    pub(crate) async fn create_run_associated_waitpoint(&self, run: &Run) -> Result<Waitpoint> {
        let waitpoint = Waitpoint::new_run_associated(&run.environment.project_id, run.id);
        self.store.insert_waitpoint(&waitpoint).await?;
        Ok(waitpoint)
    }

    /// Creates a DATETIME waitpoint and schedules the delayed job that
    /// completes it at `completed_after`.
    pub async fn create_datetime_waitpoint(
        &self,
        project_id: &str,
        completed_after: DateTime<Utc>,
    ) -> Result<Waitpoint> {
        let waitpoint = Waitpoint::new_datetime(project_id, completed_after);
        self.store.insert_waitpoint(&waitpoint).await?;
        self.delayed
            .enqueue(
                DelayedJob::CompleteDateTimeWaitpoint {
                    waitpoint_id: waitpoint.id,
                },
                completed_after,
            )
            .await?;
        Ok(waitpoint)
    }

    /// Creates a MANUAL waitpoint completed by an external call.
    pub async fn create_manual_waitpoint(
        &self,
        project_id: &str,
        idempotency_key: Option<String>,
    ) -> Result<Waitpoint> {
        let waitpoint = Waitpoint::new_manual(project_id, idempotency_key);
        self.store.insert_waitpoint(&waitpoint).await?;
        Ok(waitpoint)
    }

    /// Blocks a run behind a waitpoint, taking the run's lock.
    pub async fn block_run(&self, run_id: Uuid, waitpoint: &Waitpoint) -> Result<()> {
        let lock = self.locks.acquire(run_id).await?;
        let result = async {
            let mut run = self.load_run(run_id).await?;
            self.block_run_with_waitpoint(&mut run, waitpoint).await
        }
        .await;
        self.locks.release(lock).await?;
        result
    }

    /// Blocks `run` behind `waitpoint`; the caller holds the run's lock.
    ///
    /// A run with a live worker keeps its concurrency slot and moves to
    /// EXECUTING_WITH_WAITPOINTS (the runner may then request suspension);
    /// any other run releases its slot and moves to BLOCKED_BY_WAITPOINTS.
    /// The message body survives either way, so unblocking re-enqueues
    /// without rebuilding the message.
    pub(crate) async fn block_run_with_waitpoint(
        &self,
        run: &mut Run,
        waitpoint: &Waitpoint,
    ) -> Result<()> {
        if run.status.is_terminal() {
            return Err(EngineError::RunIsTerminal {
                run_id: run.id,
                status: run.status,
            });
        }
        self.store
            .block_run_with_waitpoint(run.id, waitpoint.id, &run.environment.project_id)
            .await?;

        if run.status != RunStatus::Delayed {
            run.status = RunStatus::WaitingToResume;
        }
        self.store.update_run(run).await?;

        let latest = self
            .store
            .latest_snapshot(run.id)
            .await?
            .ok_or(EngineError::NoSnapshot(run.id))?;
        match latest.execution_status {
            ExecutionStatus::Executing
            | ExecutionStatus::ExecutingWithWaitpoints
            | ExecutionStatus::PendingExecuting => {
                self.append_snapshot(
                    run,
                    ExecutionStatus::ExecutingWithWaitpoints,
                    format!("blocked by waitpoint {}", waitpoint.id),
                    SnapshotOptions {
                        worker_id: latest.worker_id.clone(),
                        attempt_number: latest.attempt_number,
                        ..SnapshotOptions::default()
                    },
                )
                .await?;
            }
            _ => {
                self.queue.release_concurrency(run.id).await?;
                self.append_snapshot(
                    run,
                    ExecutionStatus::BlockedByWaitpoints,
                    format!("blocked by waitpoint {}", waitpoint.id),
                    SnapshotOptions::default(),
                )
                .await?;
            }
        }
        debug!(run_id = %run.id, waitpoint_id = %waitpoint.id, "run blocked");
        Ok(())
    }

    /// Completes a waitpoint and continues every run it was the last
    /// blocker for. Idempotent: completing a COMPLETED waitpoint is a
    /// no-op and never reopens it.
    pub async fn complete_waitpoint(
        &self,
        waitpoint_id: Uuid,
        output: Option<String>,
        output_is_error: bool,
    ) -> Result<()> {
        let Some(completion) = self
            .store
            .complete_waitpoint(waitpoint_id, output, output_is_error)
            .await?
        else {
            debug!(%waitpoint_id, "waitpoint already completed");
            return Ok(());
        };

        info!(
            %waitpoint_id,
            unblocked = completion.unblocked_run_ids.len(),
            "waitpoint completed"
        );
        for run_id in completion.unblocked_run_ids {
            if let Err(e) = self.continue_run(run_id, vec![waitpoint_id]).await {
                // The scanner sweeps up runs whose wakeup was lost here.
                warn!(%run_id, "failed to continue run after waitpoint completion: {e}");
            }
        }
        Ok(())
    }

    /// Moves an unblocked run back toward execution.
    pub async fn continue_run(
        &self,
        run_id: Uuid,
        completed_waitpoint_ids: Vec<Uuid>,
    ) -> Result<()> {
        let lock = self.locks.acquire(run_id).await?;
        let result = self.continue_run_locked(run_id, completed_waitpoint_ids).await;
        self.locks.release(lock).await?;
        result
    }

    pub(crate) async fn continue_run_locked(
        &self,
        run_id: Uuid,
        completed_waitpoint_ids: Vec<Uuid>,
    ) -> Result<()> {
        let mut run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        if !self.store.waitpoints_blocking_run(run_id).await?.is_empty() {
            // Another waitpoint still blocks the run; its completion will
            // land here again.
            return Ok(());
        }
        let latest = self
            .store
            .latest_snapshot(run_id)
            .await?
            .ok_or(EngineError::NoSnapshot(run_id))?;

        // A live worker is still attached: it never released its slot (or
        // can try to reacquire), so hand execution straight back instead of
        // going through the queue.
        let worker_attached = matches!(
            latest.execution_status,
            ExecutionStatus::ExecutingWithWaitpoints | ExecutionStatus::PendingExecuting
        );
        if worker_attached {
            self.append_snapshot(
                &run,
                ExecutionStatus::PendingExecuting,
                "waitpoints completed, ready to continue",
                SnapshotOptions {
                    worker_id: latest.worker_id.clone(),
                    attempt_number: latest.attempt_number,
                    completed_waitpoint_ids,
                },
            )
            .await?;
            self.work_notify.notify_waiters();
            return Ok(());
        }

        // Suspended with a worker still holding the run: try to re-take the
        // released slot and resume in place; a full queue degrades to a
        // plain re-enqueue at the back.
        if latest.execution_status == ExecutionStatus::Suspended
            && latest.worker_id.is_some()
            && self.queue.reacquire_concurrency(run_id).await.unwrap_or(false)
        {
            run.status = RunStatus::Executing;
            self.store.update_run(&run).await?;
            self.append_snapshot(
                &run,
                ExecutionStatus::PendingExecuting,
                "waitpoints completed, resuming suspended run",
                SnapshotOptions {
                    worker_id: latest.worker_id.clone(),
                    attempt_number: latest.attempt_number,
                    completed_waitpoint_ids,
                },
            )
            .await?;
            self.work_notify.notify_waiters();
            return Ok(());
        }

        run.status = RunStatus::Pending;
        self.store.update_run(&run).await?;
        self.enqueue_run(&run, Utc::now(), completed_waitpoint_ids).await?;
        debug!(run_id = %run.id, "run re-enqueued after unblock");
        Ok(())
    }

    /// Runner-requested suspension after EXECUTING_WITH_WAITPOINTS.
    ///
    /// Declined when the blocking waitpoints completed in the meantime —
    /// the runner stays alive and continues instead.
    pub async fn suspend(&self, run_id: Uuid, snapshot_id: Uuid) -> Result<SuspendOutcome> {
        let lock = self.locks.acquire(run_id).await?;
        let result = self.suspend_locked(run_id, snapshot_id).await;
        self.locks.release(lock).await?;
        result
    }

    async fn suspend_locked(&self, run_id: Uuid, snapshot_id: Uuid) -> Result<SuspendOutcome> {
        let latest = self.verify_snapshot(run_id, snapshot_id).await?;
        let run = self.load_run(run_id).await?;

        if self.store.waitpoints_blocking_run(run_id).await?.is_empty() {
            debug!(%run_id, "suspension declined: waitpoints already completed");
            return Ok(SuspendOutcome {
                suspended: false,
                snapshot: latest,
            });
        }

        self.queue.release_concurrency(run_id).await?;
        // The runner kills its child and detaches after suspending, so no
        // worker is recorded; resume goes back through the queue. A
        // transport that keeps the session attached records itself here
        // and resumes in place instead.
        let snapshot = self
            .append_snapshot(
                &run,
                ExecutionStatus::Suspended,
                "suspended on waitpoints",
                SnapshotOptions {
                    attempt_number: latest.attempt_number,
                    ..SnapshotOptions::default()
                },
            )
            .await?;
        Ok(SuspendOutcome {
            suspended: true,
            snapshot,
        })
    }

    /// Runner continues after PENDING_EXECUTING: execution resumes with the
    /// completed-waitpoint payloads attached.
    pub async fn continue_run_execution(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
    ) -> Result<ExecutionSnapshot> {
        let lock = self.locks.acquire(run_id).await?;
        let result = async {
            let latest = self.verify_snapshot(run_id, snapshot_id).await?;
            let mut run = self.load_run(run_id).await?;
            run.status = RunStatus::Executing;
            self.store.update_run(&run).await?;
            self.append_snapshot(
                &run,
                ExecutionStatus::Executing,
                "continued after waitpoints",
                SnapshotOptions {
                    worker_id: latest.worker_id.clone(),
                    attempt_number: latest.attempt_number,
                    completed_waitpoint_ids: latest.completed_waitpoint_ids.clone(),
                },
            )
            .await
        }
        .await;
        self.locks.release(lock).await?;
        result
    }

    /// Pages through WAITING_TO_RESUME runs older than the configured age
    /// and repairs lost wakeups: stale blocking rows whose waitpoints
    /// completed are dropped, and fully-unblocked runs continue.
    ///
    /// Returns the number of runs continued.
    pub async fn scan_stalled_waiting_runs(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(
                self.config.waiting_to_resume_scan_age.as_millis() as i64
            );
        let runs = self.store.runs_waiting_to_resume_since(cutoff, 100).await?;
        let mut continued = 0;

        for run in runs {
            let lock = self.locks.acquire(run.id).await?;
            let result = async {
                let mut completed = Vec::new();
                for row in self.store.waitpoints_blocking_run(run.id).await? {
                    let waitpoint = self.store.get_waitpoint(row.waitpoint_id).await?;
                    if waitpoint.map(|w| w.status) == Some(WaitpointStatus::Completed) {
                        warn!(
                            run_id = %run.id,
                            waitpoint_id = %row.waitpoint_id,
                            "dropping stale blocking row for completed waitpoint"
                        );
                        self.store
                            .unblock_run_from_waitpoint(run.id, row.waitpoint_id)
                            .await?;
                        completed.push(row.waitpoint_id);
                    }
                }
                if self.store.waitpoints_blocking_run(run.id).await?.is_empty() {
                    self.continue_run_locked(run.id, completed).await?;
                    return Ok::<bool, EngineError>(true);
                }
                Ok(false)
            }
            .await;
            self.locks.release(lock).await?;
            if result? {
                continued += 1;
            }
        }
        Ok(continued)
    }
}
