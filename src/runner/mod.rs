//! Runner-side half of the supervisor/runner protocol.
//!
//! The runner is single-threaded cooperative: at most one attempt in
//! flight, with every protocol reaction serialized through one loop (the
//! in-process equivalent of the local mutex guarding snapshot-change
//! handling). It long-polls for work, starts attempts, heartbeats every 30
//! seconds, polls the snapshot every 5 seconds as the fallback for missed
//! `run:notify` pushes, and drives a state machine keyed by each observed
//! execution status:
//!
//! - `PENDING_CANCEL` → cancel user code, submit an aborted completion
//! - `EXECUTING_WITH_WAITPOINTS` → request suspension (may be declined)
//! - `SUSPENDED` → drop the attempt and return to warm start
//! - `PENDING_EXECUTING` → call continue, then deliver completed waitpoints
//! - `EXECUTING` with completed waitpoints → deliver them to user code
//!
//! A snapshot-id or attempt-number the platform disagrees on is fatal for
//! the current attempt; the runner returns to warm start.

use crate::core::{
    AttemptCompletion, AttemptExecution, AttemptStatus, CompletedWaitpoint, DequeuedMessage,
    ExecutionSnapshot, ExecutionStatus, RunError, RunErrorCode,
};
use crate::engine::EngineError;
use crate::supervisor::PlatformClient;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one user-task execution.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// Serialized output (JSON text).
    Success(String),
    Failure {
        error: RunError,
        /// Requested retry delay; `None` fails the run terminally.
        retry_delay: Option<Duration>,
    },
}

/// Everything handed to user code for one attempt.
pub struct TaskContext {
    pub execution: AttemptExecution,
    /// Fired when the platform cancels the run; user code should wind down.
    pub cancelled: CancellationToken,
    /// Waitpoint completions delivered mid-attempt (duration waits and
    /// child runs that resolved without suspension).
    pub waitpoints: mpsc::UnboundedReceiver<CompletedWaitpoint>,
}

type BoxedTask =
    Arc<dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send>> + Send + Sync>;

/// Maps task identifiers to their executors.
///
/// # Example
///
/// ```no_run
/// use drover::runner::{TaskOutcome, TaskRegistry};
///
/// let mut registry = TaskRegistry::new();
/// registry.register("hello", |ctx| async move {
///     let _payload = ctx.execution.payload;
///     TaskOutcome::Success("\"hi\"".to_string())
/// });
/// ```
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, BoxedTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, task_identifier: impl Into<String>, task: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let identifier = task_identifier.into();
        debug!(task = %identifier, "registered task");
        self.tasks
            .insert(identifier, Arc::new(move |ctx| Box::pin(task(ctx))));
    }

    fn get(&self, task_identifier: &str) -> Option<BoxedTask> {
        self.tasks.get(task_identifier).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Warm-start loop bounds.
#[derive(Debug, Clone)]
pub struct WarmStartConfig {
    /// Passed through to each long-poll dequeue.
    pub connection_timeout: Duration,
    /// The runner exits after this long without receiving any run.
    pub total_duration: Duration,
}

impl Default for WarmStartConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            total_duration: Duration::from_secs(60),
        }
    }
}

/// Runner tuning.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub heartbeat_interval: Duration,
    pub snapshot_poll_interval: Duration,
    pub warm_start: WarmStartConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            snapshot_poll_interval: Duration::from_secs(5),
            warm_start: WarmStartConfig::default(),
        }
    }
}

/// How one attempt ended, from the runner's point of view.
enum AttemptEnd {
    /// Run finished (or retry went through the queue); go to warm start.
    Done,
    /// Platform asked for an immediate in-place retry.
    RetryImmediately {
        delay: Duration,
        snapshot_id: Uuid,
        /// Attempt that just ran; the next one must be exactly this + 1.
        attempt_number: u32,
    },
    /// The run suspended; drop it and go to warm start.
    Suspended,
    /// Snapshot/attempt disagreement or a dead run; abandon it.
    Fatal,
}

/// A single remote run-process.
pub struct Runner {
    client: Arc<dyn PlatformClient>,
    registry: Arc<TaskRegistry>,
    runner_id: String,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(
        client: Arc<dyn PlatformClient>,
        registry: Arc<TaskRegistry>,
        runner_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            registry,
            runner_id: runner_id.into(),
            config: RunnerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Warm-start loop: long-poll for runs until `total_duration` passes
    /// with nothing to do, then exit. Returns the number of runs handled.
    pub async fn run(&self) -> crate::engine::Result<usize> {
        let mut handled = 0usize;
        let mut idle_deadline =
            tokio::time::Instant::now() + self.config.warm_start.total_duration;
        info!(runner_id = %self.runner_id, "runner entering warm start");

        loop {
            if tokio::time::Instant::now() >= idle_deadline {
                info!(runner_id = %self.runner_id, handled, "runner idle timeout, exiting");
                return Ok(handled);
            }
            match self.client.dequeue().await? {
                Some(dequeued) => {
                    let is_warm = handled > 0;
                    self.execute_run(dequeued, is_warm).await;
                    handled += 1;
                    idle_deadline =
                        tokio::time::Instant::now() + self.config.warm_start.total_duration;
                }
                None => continue,
            }
        }
    }

    /// Drives one dequeued run through as many in-place attempts as the
    /// platform asks for.
    pub async fn execute_run(&self, dequeued: DequeuedMessage, is_warm_start: bool) {
        let run_id = dequeued.message.run_id;
        let mut snapshot_id = dequeued.snapshot_id;
        let mut expected_attempt: Option<u32> = None;
        let mut warm = is_warm_start;

        loop {
            match self
                .execute_attempt(run_id, snapshot_id, expected_attempt, warm)
                .await
            {
                AttemptEnd::RetryImmediately {
                    delay,
                    snapshot_id: next,
                    attempt_number,
                } => {
                    debug!(%run_id, ?delay, "sleeping before immediate retry");
                    tokio::time::sleep(delay).await;
                    snapshot_id = next;
                    expected_attempt = Some(attempt_number + 1);
                    warm = true;
                }
                AttemptEnd::Done | AttemptEnd::Suspended | AttemptEnd::Fatal => return,
            }
        }
    }

    async fn execute_attempt(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        expected_attempt: Option<u32>,
        is_warm_start: bool,
    ) -> AttemptEnd {
        let execution = match self
            .client
            .start_attempt(run_id, snapshot_id, &self.runner_id, is_warm_start)
            .await
        {
            Ok(execution) => execution,
            Err(EngineError::SnapshotMismatch { .. }) => {
                warn!(%run_id, "stale snapshot at attempt start, abandoning run");
                return AttemptEnd::Fatal;
            }
            Err(e) => {
                warn!(%run_id, "failed to start attempt: {e}");
                return AttemptEnd::Fatal;
            }
        };

        // Attempt-number invariant: a disagreement with the platform means
        // another process advanced the run; this attempt is dead.
        if let Some(expected) = expected_attempt {
            if execution.attempt_number != expected {
                warn!(
                    %run_id,
                    expected,
                    actual = execution.attempt_number,
                    "attempt number mismatch, abandoning run"
                );
                return AttemptEnd::Fatal;
            }
        }

        let mut current_snapshot = execution.snapshot_id;
        let cancelled = CancellationToken::new();
        let (waitpoint_tx, waitpoint_rx) = mpsc::unbounded_channel();
        for waitpoint in &execution.completed_waitpoints {
            let _ = waitpoint_tx.send(waitpoint.clone());
        }

        let Some(task) = self.registry.get(&execution.task_identifier) else {
            warn!(task = %execution.task_identifier, "no executor registered");
            let completion = AttemptCompletion::failed(RunError::new(
                RunErrorCode::TaskRunInternalError,
                format!("no executor registered for {}", execution.task_identifier),
            ));
            return self.submit_completion(run_id, current_snapshot, completion).await;
        };

        let context = TaskContext {
            execution: execution.clone(),
            cancelled: cancelled.clone(),
            waitpoints: waitpoint_rx,
        };
        let mut task_future = task(context);
        let mut notify_rx = self.client.subscribe(run_id);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut poll = tokio::time::interval(self.config.snapshot_poll_interval);
        heartbeat.reset();
        poll.reset();
        let mut last_seen_snapshot = current_snapshot;

        loop {
            tokio::select! {
                outcome = &mut task_future => {
                    let completion = match outcome {
                        TaskOutcome::Success(output) => AttemptCompletion::succeeded(output),
                        TaskOutcome::Failure { error, retry_delay } => AttemptCompletion {
                            ok: false,
                            output: None,
                            error: Some(error),
                            retry_delay,
                        },
                    };
                    let mut end = self
                        .submit_completion(run_id, current_snapshot, completion)
                        .await;
                    if let AttemptEnd::RetryImmediately { attempt_number, .. } = &mut end {
                        *attempt_number = execution.attempt_number;
                    }
                    return end;
                }

                changed = notify_rx.recv() => {
                    if let Ok(snapshot) = changed {
                        match self
                            .handle_snapshot_change(
                                snapshot,
                                &mut last_seen_snapshot,
                                &mut current_snapshot,
                                &cancelled,
                                &waitpoint_tx,
                            )
                            .await
                        {
                            Some(end) => return end,
                            None => {}
                        }
                    }
                }

                _ = poll.tick() => {
                    match self.client.latest_snapshot(run_id).await {
                        Ok(snapshot) => {
                            if let Some(end) = self
                                .handle_snapshot_change(
                                    snapshot,
                                    &mut last_seen_snapshot,
                                    &mut current_snapshot,
                                    &cancelled,
                                    &waitpoint_tx,
                                )
                                .await
                            {
                                return end;
                            }
                        }
                        Err(e) => warn!(%run_id, "snapshot poll failed: {e}"),
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = self.client.heartbeat(run_id, current_snapshot).await {
                        // A mismatch here just means we have not yet seen
                        // the newest snapshot; the poll arm resyncs us.
                        debug!(%run_id, "heartbeat rejected: {e}");
                    }
                }
            }
        }
    }

    /// Reacts to one observed snapshot; the select loop serializes calls.
    /// Returns `Some` when the attempt is over from the runner's side.
    async fn handle_snapshot_change(
        &self,
        snapshot: ExecutionSnapshot,
        last_seen: &mut Uuid,
        current: &mut Uuid,
        cancelled: &CancellationToken,
        waitpoint_tx: &mpsc::UnboundedSender<CompletedWaitpoint>,
    ) -> Option<AttemptEnd> {
        if snapshot.id == *last_seen {
            return None;
        }
        *last_seen = snapshot.id;
        let run_id = snapshot.run_id;
        debug!(%run_id, status = %snapshot.execution_status, "observed snapshot change");

        match snapshot.execution_status {
            ExecutionStatus::PendingCancel => {
                *current = snapshot.id;
                cancelled.cancel();
                let completion = AttemptCompletion::failed(RunError::aborted());
                Some(self.submit_completion(run_id, snapshot.id, completion).await)
            }

            ExecutionStatus::ExecutingWithWaitpoints => {
                *current = snapshot.id;
                match self.client.suspend(run_id, snapshot.id).await {
                    Ok(outcome) if outcome.suspended => {
                        info!(%run_id, "suspended, returning to warm start");
                        Some(AttemptEnd::Suspended)
                    }
                    Ok(_) => {
                        debug!(%run_id, "suspension declined, staying alive");
                        None
                    }
                    Err(e) => {
                        warn!(%run_id, "suspension request failed: {e}");
                        None
                    }
                }
            }

            ExecutionStatus::Suspended => Some(AttemptEnd::Suspended),

            ExecutionStatus::PendingExecuting => {
                match self.client.continue_run(run_id, snapshot.id).await {
                    Ok(next) => {
                        *last_seen = next.id;
                        *current = next.id;
                        self.deliver_waitpoints(&next, waitpoint_tx).await;
                        None
                    }
                    Err(e) => {
                        warn!(%run_id, "continue failed: {e}");
                        Some(AttemptEnd::Fatal)
                    }
                }
            }

            ExecutionStatus::Executing => {
                *current = snapshot.id;
                self.deliver_waitpoints(&snapshot, waitpoint_tx).await;
                None
            }

            ExecutionStatus::Finished => Some(AttemptEnd::Done),

            _ => {
                *current = snapshot.id;
                None
            }
        }
    }

    async fn deliver_waitpoints(
        &self,
        snapshot: &ExecutionSnapshot,
        waitpoint_tx: &mpsc::UnboundedSender<CompletedWaitpoint>,
    ) {
        if snapshot.completed_waitpoint_ids.is_empty() {
            return;
        }
        // The snapshot carries ids only; payloads come with the next
        // attempt's execution, so mid-attempt delivery sends id markers.
        for id in &snapshot.completed_waitpoint_ids {
            let _ = waitpoint_tx.send(CompletedWaitpoint {
                id: *id,
                kind: crate::core::WaitpointKind::Manual,
                output: None,
                output_is_error: false,
            });
        }
    }

    async fn submit_completion(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        completion: AttemptCompletion,
    ) -> AttemptEnd {
        match self
            .client
            .complete_attempt(run_id, snapshot_id, completion)
            .await
        {
            Ok(result) => match result.attempt_status {
                AttemptStatus::RetryImmediately => AttemptEnd::RetryImmediately {
                    delay: result.retry_delay.unwrap_or_default(),
                    snapshot_id: result.snapshot.id,
                    attempt_number: result.snapshot.attempt_number.unwrap_or_default(),
                },
                AttemptStatus::RunFinished
                | AttemptStatus::RunPendingCancel
                | AttemptStatus::RetryQueued => AttemptEnd::Done,
            },
            Err(EngineError::SnapshotMismatch { .. }) => {
                warn!(%run_id, "snapshot mismatch at completion, abandoning run");
                AttemptEnd::Fatal
            }
            Err(e) => {
                warn!(%run_id, "failed to submit completion: {e}");
                AttemptEnd::Fatal
            }
        }
    }
}
