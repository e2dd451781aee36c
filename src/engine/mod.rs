//! The run engine: transactional run lifecycle over the store, the queue,
//! the delayed-job queue and the notifier.
//!
//! All mutating operations acquire the run's distributed lock before
//! touching snapshot/waitpoint/queue state, so no two engine processes
//! interleave state-machine steps for the same run. Every state transition
//! appends an execution snapshot and schedules a stall-check timer keyed by
//! the snapshot id; a timer whose snapshot is no longer the latest is
//! silently dropped.

mod attempt;
mod heartbeat;
mod lifecycle;
mod lock;
mod waitpoint;

pub use heartbeat::StallTimeouts;
pub use lifecycle::delayed_job_worker;
pub use lock::{
    InMemoryRunLockManager, LockError, RunLock, RunLockConfig, RunLockManager,
};
#[cfg(feature = "redis")]
pub use lock::RedisRunLockManager;
pub use waitpoint::SuspendOutcome;

use crate::core::{
    friendly_run_id, DequeuedMessage, ExecutionSnapshot, ExecutionStatus, RetryPolicy, Run,
    RunEnvironment, RunError, RunErrorCode, RunMessage, RunStatus, TaskQueue, TaskQueueType,
};
use crate::delayed::{DelayedJob, DelayedJobError, DelayedJobQueue};
use crate::notify::RunNotifier;
use crate::queue::{KeyProducer, QueueError, RunQueue};
use crate::store::{RunStore, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine error type; `status_code` gives the HTTP mapping used by the
/// external transport layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("delayed-job error: {0}")]
    Delayed(#[from] DelayedJobError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("core error: {0}")]
    Core(#[from] crate::core::Error),

    #[error("run not found: id={0}")]
    RunNotFound(Uuid),

    /// The caller's snapshot id is no longer the latest; retryable after
    /// re-reading the run.
    #[error("snapshot mismatch for run {run_id}: expected latest {expected}, got {provided}")]
    SnapshotMismatch {
        run_id: Uuid,
        expected: Uuid,
        provided: Uuid,
    },

    /// A run reached an engine operation without any snapshot; triggers the
    /// system-failure path.
    #[error("run {0} has no execution snapshot")]
    NoSnapshot(Uuid),

    /// The run is already terminal; the requested transition cannot apply.
    #[error("run {run_id} is terminal ({status})")]
    RunIsTerminal { run_id: Uuid, status: RunStatus },
}

impl EngineError {
    /// HTTP status for the API boundary: 409 on snapshot mismatch or a held
    /// lock, 404 on unknown run, 5xx otherwise.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::SnapshotMismatch { .. } => 409,
            EngineError::Lock(LockError::Held(_)) => 409,
            EngineError::RunNotFound(_) => 404,
            EngineError::RunIsTerminal { .. } => 409,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry delays below this keep the runner warm (RETRY_IMMEDIATELY);
    /// longer delays go back through the queue (RETRY_QUEUED).
    pub retry_immediately_threshold: Duration,
    /// Attempts allowed when a trigger does not specify `max_attempts`.
    pub default_max_attempts: u32,
    /// Backoff for re-queueing crashed attempts (the run's own
    /// `max_attempts` still bounds the budget).
    pub crash_retry: RetryPolicy,
    /// Stall-check timers per execution status.
    pub stall_timeouts: StallTimeouts,
    /// WAITING_TO_RESUME runs untouched for longer than this are picked up
    /// by the lost-wakeup scanner.
    pub waiting_to_resume_scan_age: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_immediately_threshold: Duration::from_secs(5),
            default_max_attempts: 1,
            crash_retry: RetryPolicy::STANDARD,
            stall_timeouts: StallTimeouts::default(),
            waiting_to_resume_scan_age: Duration::from_secs(300),
        }
    }
}

/// Inputs to [`RunEngine::trigger`].
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub task_identifier: String,
    pub payload: String,
    pub payload_type: String,
    pub environment: RunEnvironment,
    pub queue_name: Option<String>,
    /// When set, upserts the queue row and pushes the limit to the queue.
    pub queue_concurrency_limit: Option<u32>,
    /// Master-queue name; defaults to the environment's shared queue.
    pub master_queue: Option<String>,
    pub concurrency_key: Option<String>,
    pub idempotency_key: Option<String>,
    pub max_attempts: Option<u32>,
    pub ttl: Option<Duration>,
    pub delay_until: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub parent_run_id: Option<Uuid>,
    pub resume_parent_on_completion: bool,
    pub batch_id: Option<Uuid>,
    pub trace_context: Option<String>,
}

impl TriggerRequest {
    pub fn new(
        task_identifier: impl Into<String>,
        payload: impl Into<String>,
        environment: RunEnvironment,
    ) -> Self {
        Self {
            task_identifier: task_identifier.into(),
            payload: payload.into(),
            payload_type: "application/json".to_string(),
            environment,
            queue_name: None,
            queue_concurrency_limit: None,
            master_queue: None,
            concurrency_key: None,
            idempotency_key: None,
            max_attempts: None,
            ttl: None,
            delay_until: None,
            tags: Vec::new(),
            parent_run_id: None,
            resume_parent_on_completion: false,
            batch_id: None,
            trace_context: None,
        }
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_queue_concurrency_limit(mut self, limit: u32) -> Self {
        self.queue_concurrency_limit = Some(limit);
        self
    }

    pub fn with_master_queue(mut self, name: impl Into<String>) -> Self {
        self.master_queue = Some(name.into());
        self
    }

    pub fn with_concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_delay_until(mut self, delay_until: DateTime<Utc>) -> Self {
        self.delay_until = Some(delay_until);
        self
    }

    pub fn with_parent(mut self, parent_run_id: Uuid, resume_parent_on_completion: bool) -> Self {
        self.parent_run_id = Some(parent_run_id);
        self.resume_parent_on_completion = resume_parent_on_completion;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Builder for [`RunEngine`]; tests inject fakes through the same seams.
#[derive(Default)]
pub struct RunEngineBuilder {
    store: Option<Arc<dyn RunStore>>,
    queue: Option<Arc<dyn RunQueue>>,
    delayed: Option<Arc<dyn DelayedJobQueue>>,
    locks: Option<Arc<dyn RunLockManager>>,
    notifier: Option<Arc<dyn RunNotifier>>,
    keys: Option<KeyProducer>,
    config: EngineConfig,
}

impl RunEngineBuilder {
    pub fn store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn RunQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn delayed_jobs(mut self, delayed: Arc<dyn DelayedJobQueue>) -> Self {
        self.delayed = Some(delayed);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn RunLockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn RunNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn keys(mut self, keys: KeyProducer) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> std::result::Result<RunEngine, String> {
        Ok(RunEngine {
            store: self.store.ok_or("store is required")?,
            queue: self.queue.ok_or("queue is required")?,
            delayed: self.delayed.ok_or("delayed-job queue is required")?,
            locks: self.locks.ok_or("lock manager is required")?,
            notifier: self.notifier.ok_or("notifier is required")?,
            keys: self.keys.unwrap_or_default(),
            config: self.config,
            work_notify: Arc::new(Notify::new()),
        })
    }
}

/// Process-wide run engine instance.
pub struct RunEngine {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn RunQueue>,
    delayed: Arc<dyn DelayedJobQueue>,
    locks: Arc<dyn RunLockManager>,
    notifier: Arc<dyn RunNotifier>,
    keys: KeyProducer,
    config: EngineConfig,
    /// Kicked whenever a run becomes dequeueable; long-poll dequeues wait
    /// on it instead of tight-polling.
    work_notify: Arc<Notify>,
}

impl RunEngine {
    pub fn builder() -> RunEngineBuilder {
        RunEngineBuilder::default()
    }

    /// Fully in-memory engine for tests and embedded single-process use.
    pub fn in_memory() -> Self {
        Self::builder()
            .store(Arc::new(crate::store::InMemoryRunStore::new()))
            .queue(Arc::new(crate::queue::InMemoryRunQueue::default()))
            .delayed_jobs(Arc::new(crate::delayed::InMemoryDelayedJobQueue::new()))
            .locks(Arc::new(InMemoryRunLockManager::default()))
            .notifier(Arc::new(crate::notify::InProcessNotifier::new()))
            .build()
            .unwrap_or_else(|e| unreachable!("in-memory engine wiring: {e}"))
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn RunQueue> {
        &self.queue
    }

    pub fn notifier(&self) -> &Arc<dyn RunNotifier> {
        &self.notifier
    }

    pub fn delayed_jobs(&self) -> &Arc<dyn DelayedJobQueue> {
        &self.delayed
    }

    pub fn keys(&self) -> &KeyProducer {
        &self.keys
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Notified whenever new work may be dequeueable.
    pub fn work_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.work_notify)
    }

    /// Resolves the master-queue key a run publishes to.
    pub fn master_queue_key(&self, env: &RunEnvironment, name: Option<&str>) -> String {
        match name {
            Some(name) => self.keys.master_queue_key(name),
            None => self.keys.shared_queue_key(env),
        }
    }

    // ========================================================================
    // trigger
    // ========================================================================

    /// Accepts a trigger request: creates the run row, its initial snapshot
    /// and its run-completion waitpoint, optionally blocks the parent,
    /// and either enqueues the run or parks it behind a datetime waitpoint.
    ///
    /// Idempotency: a request whose `idempotency_key` matches an existing
    /// non-terminal run in the environment returns that run unchanged.
    pub async fn trigger(&self, request: TriggerRequest) -> Result<Run> {
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self
                .store
                .find_run_by_idempotency_key(&request.environment.environment_id, key)
                .await?
            {
                debug!(run_id = %existing.id, idempotency_key = %key, "trigger deduplicated");
                return Ok(existing);
            }
        }

        let run_id = Uuid::new_v4();
        let now = Utc::now();
        let queue_name = request
            .queue_name
            .clone()
            .unwrap_or_else(|| format!("task/{}", request.task_identifier));
        let master_queue =
            self.master_queue_key(&request.environment, request.master_queue.as_deref());

        let (parent, root_run_id, depth) = match request.parent_run_id {
            Some(parent_id) => {
                let parent = self
                    .store
                    .get_run(parent_id)
                    .await?
                    .ok_or(EngineError::RunNotFound(parent_id))?;
                let root = parent.root_run_id.unwrap_or(parent.id);
                let depth = parent.depth + 1;
                (Some(parent), Some(root), depth)
            }
            None => (None, None, 0),
        };

        let mut run = Run {
            id: run_id,
            friendly_id: friendly_run_id(run_id),
            task_identifier: request.task_identifier.clone(),
            payload: request.payload.clone(),
            payload_type: request.payload_type.clone(),
            status: if request.delay_until.is_some() {
                RunStatus::Delayed
            } else {
                RunStatus::Pending
            },
            environment: request.environment.clone(),
            queue_name: queue_name.clone(),
            master_queue: master_queue.clone(),
            concurrency_key: request.concurrency_key.clone(),
            idempotency_key: request.idempotency_key.clone(),
            max_attempts: request.max_attempts.unwrap_or(self.config.default_max_attempts),
            attempt_count: 0,
            ttl_secs: request.ttl.map(|t| t.as_secs()),
            delay_until: request.delay_until,
            tags: request.tags.clone(),
            parent_run_id: request.parent_run_id,
            root_run_id,
            batch_id: request.batch_id,
            depth,
            resume_parent_on_completion: request.resume_parent_on_completion,
            associated_waitpoint_id: None,
            output: None,
            error: None,
            trace_context: request.trace_context.clone(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let lock = self.locks.acquire(run_id).await?;
        let result = self.trigger_locked(&mut run, &request, parent).await;
        self.locks.release(lock).await?;
        result?;

        info!(
            run_id = %run.id,
            task = %run.task_identifier,
            queue = %run.queue_name,
            status = %run.status,
            "run triggered"
        );
        Ok(run)
    }

    async fn trigger_locked(
        &self,
        run: &mut Run,
        request: &TriggerRequest,
        parent: Option<Run>,
    ) -> Result<()> {
        self.store.insert_run(run).await?;
        self.append_snapshot(
            run,
            ExecutionStatus::RunCreated,
            "run created",
            SnapshotOptions::default(),
        )
        .await?;

        // The run-completion waitpoint parents attach to.
        let associated = self.create_run_associated_waitpoint(run).await?;
        run.associated_waitpoint_id = Some(associated.id);
        self.store.update_run(run).await?;

        if request.resume_parent_on_completion {
            if let Some(parent) = parent {
                // The parent gets its own lock; lock order is always
                // child-then-parent, so completion and trigger cannot
                // deadlock each other.
                self.block_run(parent.id, &associated).await?;
            }
        }

        if let Some(limit) = request.queue_concurrency_limit {
            self.store
                .upsert_task_queue(&TaskQueue {
                    environment_id: run.environment.environment_id.clone(),
                    name: run.queue_name.clone(),
                    concurrency_limit: Some(limit),
                    queue_type: TaskQueueType::Named,
                })
                .await?;
            self.queue
                .update_queue_concurrency_limits(&run.environment, &run.queue_name, limit)
                .await?;
        }

        if let Some(delay_until) = run.delay_until {
            let delay_waitpoint = self
                .create_datetime_waitpoint(&run.environment.project_id, delay_until)
                .await?;
            self.block_run_with_waitpoint(run, &delay_waitpoint).await?;
        } else {
            if let Some(ttl) = run.ttl() {
                self.delayed
                    .enqueue(
                        DelayedJob::ExpireRun { run_id: run.id },
                        Utc::now() + ChronoDuration::milliseconds(ttl.as_millis() as i64),
                    )
                    .await?;
            }
            self.enqueue_run(run, Utc::now(), Vec::new()).await?;
        }
        Ok(())
    }

    // ========================================================================
    // dequeue
    // ========================================================================

    /// Pulls one run from a master queue for a consumer.
    ///
    /// On a hit, verifies under the run's lock that the latest snapshot is
    /// QUEUED (or BLOCKED_BY_WAITPOINTS, for a run resurfacing from a
    /// recovery path), appends DEQUEUED_FOR_EXECUTION and returns the
    /// message with the new snapshot id.
    pub async fn dequeue_from_master_queue(
        &self,
        consumer_id: &str,
        master_queue: &str,
    ) -> Result<Option<DequeuedMessage>> {
        let Some(message) = self
            .queue
            .dequeue_message_in_shared_queue(consumer_id, master_queue)
            .await?
        else {
            return Ok(None);
        };
        let run_id = message.run_id;

        let lock = self.locks.acquire(run_id).await?;
        let result = self.dequeue_locked(consumer_id, message).await;
        self.locks.release(lock).await?;

        match result {
            Ok(dequeued) => Ok(Some(dequeued)),
            Err(EngineError::RunNotFound(_)) => {
                // Orphaned message with no run row; drop it.
                warn!(%run_id, "dequeued message for unknown run, dropping");
                self.queue.acknowledge_message(run_id).await?;
                Ok(None)
            }
            Err(e @ (EngineError::NoSnapshot(_) | EngineError::SnapshotMismatch { .. })) => {
                // The queue handed us a run the state machine cannot start;
                // fail it rather than bouncing it between consumers.
                warn!(%run_id, "dequeued run in invalid state: {e}");
                self.system_failure(
                    run_id,
                    RunError::new(RunErrorCode::TaskRunInternalError, e.to_string()),
                )
                .await?;
                Ok(None)
            }
            Err(e) => {
                // Transient infrastructure error: put the message back.
                self.queue.nack_message(run_id, None).await?;
                Err(e)
            }
        }
    }

    async fn dequeue_locked(
        &self,
        consumer_id: &str,
        message: RunMessage,
    ) -> Result<DequeuedMessage> {
        let run_id = message.run_id;
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        let latest = self
            .store
            .latest_snapshot(run_id)
            .await?
            .ok_or(EngineError::NoSnapshot(run_id))?;

        if !matches!(
            latest.execution_status,
            ExecutionStatus::Queued | ExecutionStatus::BlockedByWaitpoints
        ) {
            return Err(EngineError::SnapshotMismatch {
                run_id,
                expected: latest.id,
                provided: latest.id,
            });
        }

        let snapshot = self
            .append_snapshot(
                &run,
                ExecutionStatus::DequeuedForExecution,
                format!("dequeued by {consumer_id}"),
                SnapshotOptions {
                    worker_id: Some(consumer_id.to_string()),
                    completed_waitpoint_ids: latest.completed_waitpoint_ids.clone(),
                    ..SnapshotOptions::default()
                },
            )
            .await?;

        Ok(DequeuedMessage {
            message,
            snapshot_id: snapshot.id,
            run_friendly_id: run.friendly_id.clone(),
        })
    }

    // ========================================================================
    // shared plumbing
    // ========================================================================

    /// Builds the queue message for a run and enqueues it, appending a
    /// QUEUED snapshot and waking long-poll dequeuers.
    pub(crate) async fn enqueue_run(
        &self,
        run: &Run,
        available_at: DateTime<Utc>,
        completed_waitpoint_ids: Vec<Uuid>,
    ) -> Result<ExecutionSnapshot> {
        let message = RunMessage {
            run_id: run.id,
            task_identifier: run.task_identifier.clone(),
            organization_id: run.environment.organization_id.clone(),
            project_id: run.environment.project_id.clone(),
            environment_id: run.environment.environment_id.clone(),
            environment_type: run.environment.environment_type,
            queue_name: run.queue_name.clone(),
            concurrency_key: run.concurrency_key.clone(),
            master_queue: run.master_queue.clone(),
            enqueued_at: Utc::now(),
            available_at,
            attempt_count: run.attempt_count,
        };
        self.queue
            .enqueue_message(&run.environment, &run.master_queue, message)
            .await?;

        let snapshot = self
            .append_snapshot(
                run,
                ExecutionStatus::Queued,
                "queued",
                SnapshotOptions {
                    completed_waitpoint_ids,
                    ..SnapshotOptions::default()
                },
            )
            .await?;
        self.work_notify.notify_waiters();
        Ok(snapshot)
    }

    /// Appends a snapshot, schedules its stall-check timer and notifies the
    /// run's room. The single entry point for snapshot creation.
    pub(crate) async fn append_snapshot(
        &self,
        run: &Run,
        execution_status: ExecutionStatus,
        description: impl Into<String>,
        options: SnapshotOptions,
    ) -> Result<ExecutionSnapshot> {
        let mut snapshot =
            ExecutionSnapshot::new(run.id, execution_status, run.status, description);
        snapshot.worker_id = options.worker_id;
        snapshot.attempt_number = options.attempt_number;
        snapshot.completed_waitpoint_ids = options.completed_waitpoint_ids;
        self.store.append_snapshot(&snapshot).await?;

        let interval = self.config.stall_timeouts.interval_for(execution_status);
        self.delayed
            .enqueue(
                DelayedJob::HeartbeatSnapshot {
                    run_id: run.id,
                    snapshot_id: snapshot.id,
                },
                Utc::now() + ChronoDuration::milliseconds(interval.as_millis() as i64),
            )
            .await?;

        debug!(
            run_id = %run.id,
            status = %execution_status,
            run_status = %run.status,
            "appended snapshot"
        );
        self.notifier.notify(&snapshot);
        Ok(snapshot)
    }

    /// Loads the latest snapshot and checks it against a caller-provided id.
    pub(crate) async fn verify_snapshot(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
    ) -> Result<ExecutionSnapshot> {
        let latest = self
            .store
            .latest_snapshot(run_id)
            .await?
            .ok_or(EngineError::NoSnapshot(run_id))?;
        if latest.id != snapshot_id {
            return Err(EngineError::SnapshotMismatch {
                run_id,
                expected: latest.id,
                provided: snapshot_id,
            });
        }
        Ok(latest)
    }

    pub(crate) async fn load_run(&self, run_id: Uuid) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    /// Resolves the completed-waitpoint payloads referenced by a snapshot.
    pub(crate) async fn completed_waitpoints_for(
        &self,
        snapshot: &ExecutionSnapshot,
    ) -> Result<Vec<crate::core::CompletedWaitpoint>> {
        if snapshot.completed_waitpoint_ids.is_empty() {
            return Ok(Vec::new());
        }
        let waitpoints = self
            .store
            .get_waitpoints(&snapshot.completed_waitpoint_ids)
            .await?;
        Ok(waitpoints
            .into_iter()
            .map(|w| crate::core::CompletedWaitpoint {
                id: w.id,
                kind: w.kind,
                output: w.output,
                output_is_error: w.output_is_error,
            })
            .collect())
    }

    /// Environment variables handed to the runner with an attempt. Secret
    /// resolution is an external collaborator; the engine contributes the
    /// run coordinates.
    pub(crate) fn environment_variables(&self, run: &Run) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("RUN_ID".to_string(), run.friendly_id.clone());
        vars.insert("TASK_IDENTIFIER".to_string(), run.task_identifier.clone());
        vars.insert(
            "ENVIRONMENT_ID".to_string(),
            run.environment.environment_id.clone(),
        );
        vars.insert(
            "ENVIRONMENT_TYPE".to_string(),
            run.environment.environment_type.as_str().to_string(),
        );
        vars
    }
}

/// Optional snapshot fields.
#[derive(Debug, Default, Clone)]
pub(crate) struct SnapshotOptions {
    pub worker_id: Option<String>,
    pub attempt_number: Option<u32>,
    pub completed_waitpoint_ids: Vec<Uuid>,
}
