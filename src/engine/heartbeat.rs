//! Stall-check recovery: every snapshot schedules one delayed timer; when
//! it fires with the snapshot still the latest, the run is stuck in that
//! state and gets a per-status recovery.
//!
//! The latest-snapshot-id comparison is the whole concurrency story between
//! timers and live transitions: a run that moved on has a newer snapshot,
//! and the stale timer drops itself without touching anything.

use super::{EngineError, Result, RunEngine, SnapshotOptions};
use crate::core::{ExecutionStatus, RunError, RunStatus};
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-status stall-check intervals.
#[derive(Debug, Clone)]
pub struct StallTimeouts {
    /// Applied while EXECUTING (runner heartbeats keep pushing it out).
    pub executing: Duration,
    /// Applied to every other status.
    pub default: Duration,
}

impl Default for StallTimeouts {
    fn default() -> Self {
        Self {
            executing: Duration::from_secs(15 * 60),
            default: Duration::from_secs(60),
        }
    }
}

impl StallTimeouts {
    pub fn interval_for(&self, status: ExecutionStatus) -> Duration {
        match status {
            ExecutionStatus::Executing | ExecutionStatus::ExecutingWithWaitpoints => {
                self.executing
            }
            _ => self.default,
        }
    }
}

impl RunEngine {
    /// Handles a fired `heartbeatSnapshot` timer.
    pub(crate) async fn handle_stalled_snapshot(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
    ) -> Result<()> {
        let Some(latest) = self.store.latest_snapshot(run_id).await? else {
            return Ok(());
        };
        if latest.id != snapshot_id {
            // The run moved on; this timer is stale.
            debug!(%run_id, %snapshot_id, "dropping stale stall-check");
            return Ok(());
        }

        let lock = self.locks.acquire(run_id).await?;
        let result = self.recover_stalled_locked(run_id, snapshot_id).await;
        self.locks.release(lock).await?;
        result
    }

    async fn recover_stalled_locked(&self, run_id: Uuid, snapshot_id: Uuid) -> Result<()> {
        // Re-check under the lock; a transition may have won the race.
        let Some(latest) = self.store.latest_snapshot(run_id).await? else {
            return Ok(());
        };
        if latest.id != snapshot_id {
            return Ok(());
        }
        let mut run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }

        info!(%run_id, status = %latest.execution_status, "run stalled, recovering");
        match latest.execution_status {
            // Never enqueued or sitting in a queue no consumer drains:
            // resurface the message (or build one if it never existed).
            ExecutionStatus::RunCreated | ExecutionStatus::Queued => {
                if !self.store.waitpoints_blocking_run(run_id).await?.is_empty() {
                    // Still legitimately parked; let the blocked-state
                    // recovery handle it on its own timer.
                    self.reschedule_stall_check(&run, &latest).await?;
                    return Ok(());
                }
                if self.queue.read_message(run_id).await?.is_some() {
                    self.queue.nack_message(run_id, None).await?;
                    self.append_snapshot(
                        &run,
                        ExecutionStatus::Queued,
                        "requeued by stall-check",
                        SnapshotOptions::default(),
                    )
                    .await?;
                    self.work_notify.notify_waiters();
                } else {
                    run.status = RunStatus::Pending;
                    self.store.update_run(&run).await?;
                    self.enqueue_run(&run, Utc::now(), Vec::new()).await?;
                }
            }

            // Dequeued but no attempt ever started: the consumer died
            // between claim and start.
            ExecutionStatus::DequeuedForExecution => {
                run.status = RunStatus::Pending;
                self.store.update_run(&run).await?;
                self.queue.nack_message(run_id, None).await?;
                self.append_snapshot(
                    &run,
                    ExecutionStatus::Queued,
                    "requeued after stalled dequeue",
                    SnapshotOptions::default(),
                )
                .await?;
                self.work_notify.notify_waiters();
            }

            // The runner stopped heartbeating mid-attempt: crash path.
            ExecutionStatus::Executing | ExecutionStatus::ExecutingWithWaitpoints => {
                self.fail_stalled_attempt(&mut run).await?;
            }

            // Blocked or suspended: verify the waitpoints are still really
            // pending; a lost wakeup shows up as zero blocking rows here.
            ExecutionStatus::BlockedByWaitpoints | ExecutionStatus::Suspended => {
                if self.store.waitpoints_blocking_run(run_id).await?.is_empty() {
                    warn!(%run_id, "blocked run has no blocking waitpoints, continuing");
                    self.continue_run_locked(run_id, Vec::new()).await?;
                } else {
                    self.reschedule_stall_check(&run, &latest).await?;
                }
            }

            // Runner never called continue: give the slot back and requeue.
            ExecutionStatus::PendingExecuting => {
                run.status = RunStatus::Pending;
                self.store.update_run(&run).await?;
                self.queue.nack_message(run_id, None).await?;
                self.append_snapshot(
                    &run,
                    ExecutionStatus::Queued,
                    "requeued after unclaimed continue",
                    SnapshotOptions::default(),
                )
                .await?;
                self.work_notify.notify_waiters();
            }

            // Runner never acknowledged the cancel: force it terminal.
            ExecutionStatus::PendingCancel => {
                self.finish_run(&mut run, RunStatus::Canceled, None, Some(RunError::aborted()))
                    .await?;
            }

            ExecutionStatus::Finished => {
                // Belt-and-braces cleanup; normally a no-op.
                self.queue.acknowledge_message(run_id).await?;
            }
        }
        Ok(())
    }

    /// Crash handling for a stalled attempt: retry if the budget allows,
    /// CRASHED otherwise.
    async fn fail_stalled_attempt(&self, run: &mut crate::core::Run) -> Result<()> {
        let error = RunError::stalled();
        if let Some(attempt) = self
            .store
            .attempts_for_run(run.id)
            .await?
            .into_iter()
            .find(|a| a.number == run.attempt_count && a.completed_at.is_none())
        {
            self.store
                .finalize_attempt(attempt.id, Some(error.clone()))
                .await?;
        }

        if run.attempt_count < run.max_attempts {
            run.status = RunStatus::Pending;
            self.store.update_run(run).await?;
            let delay = self.config.crash_retry.delay_for_attempt(run.attempt_count);
            let retry_at = Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64);
            self.queue.nack_message(run.id, Some(retry_at)).await?;
            self.append_snapshot(
                run,
                ExecutionStatus::Queued,
                format!("attempt {} presumed crashed, retry queued", run.attempt_count),
                SnapshotOptions::default(),
            )
            .await?;
            warn!(run_id = %run.id, attempt = run.attempt_count, "stalled attempt requeued");
        } else {
            self.finish_run(run, RunStatus::Crashed, None, Some(error)).await?;
        }
        Ok(())
    }

    /// Re-arms the stall-check for a run legitimately parked in its state.
    async fn reschedule_stall_check(
        &self,
        run: &crate::core::Run,
        latest: &crate::core::ExecutionSnapshot,
    ) -> Result<()> {
        let interval = self
            .config
            .stall_timeouts
            .interval_for(latest.execution_status);
        self.delayed
            .enqueue(
                crate::delayed::DelayedJob::HeartbeatSnapshot {
                    run_id: run.id,
                    snapshot_id: latest.id,
                },
                Utc::now() + ChronoDuration::milliseconds(interval.as_millis() as i64),
            )
            .await
            .map_err(EngineError::Delayed)
    }
}
