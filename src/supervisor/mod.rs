//! Platform-side half of the supervisor/runner protocol.
//!
//! The transport (HTTP + WebSocket) is an external collaborator; this
//! module is the typed surface it forwards to. [`PlatformClient`] is the
//! complete protocol a runner speaks — in-process runners hold a
//! [`Supervisor`] directly, and a remote transport implements the same
//! trait over the wire.
//!
//! Long-poll dequeue blocks up to `connection_timeout`, waking on the
//! engine's work signal instead of tight-polling the queue.

use crate::core::{
    AttemptCompletion, AttemptExecution, CompleteAttemptResult, DequeuedMessage,
    ExecutionSnapshot, Waitpoint,
};
use crate::engine::{Result, RunEngine, SuspendOutcome};
use crate::notify::RunNotifier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// The full protocol surface a runner needs from the platform.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Long-poll dequeue; `None` after the connection timeout (HTTP 204).
    async fn dequeue(&self) -> Result<Option<DequeuedMessage>>;

    async fn start_attempt(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        worker_id: &str,
        is_warm_start: bool,
    ) -> Result<AttemptExecution>;

    async fn heartbeat(&self, run_id: Uuid, snapshot_id: Uuid) -> Result<ExecutionSnapshot>;

    async fn complete_attempt(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        completion: AttemptCompletion,
    ) -> Result<CompleteAttemptResult>;

    async fn suspend(&self, run_id: Uuid, snapshot_id: Uuid) -> Result<SuspendOutcome>;

    async fn continue_run(&self, run_id: Uuid, snapshot_id: Uuid) -> Result<ExecutionSnapshot>;

    async fn wait_for_duration(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        completed_after: DateTime<Utc>,
    ) -> Result<Waitpoint>;

    async fn latest_snapshot(&self, run_id: Uuid) -> Result<ExecutionSnapshot>;

    /// `run:notify` subscription for the run's room.
    fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<ExecutionSnapshot>;
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long one long-poll dequeue blocks before returning empty.
    pub connection_timeout: Duration,
    /// Fallback poll interval inside the long-poll loop, for work enqueued
    /// by another process that never kicks this process's notify.
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// In-process [`PlatformClient`] wrapping the engine for one consumer and
/// one master queue.
pub struct Supervisor {
    engine: Arc<RunEngine>,
    consumer_id: String,
    master_queue: String,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        engine: Arc<RunEngine>,
        consumer_id: impl Into<String>,
        master_queue: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            consumer_id: consumer_id.into(),
            master_queue: master_queue.into(),
            config: SupervisorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Blocks up to `timeout` for a dequeueable run.
    pub async fn dequeue_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<DequeuedMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let notify = self.engine.work_notify();

        loop {
            if let Some(message) = self
                .engine
                .dequeue_from_master_queue(&self.consumer_id, &self.master_queue)
                .await?
            {
                return Ok(Some(message));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                debug!(consumer_id = %self.consumer_id, "long-poll dequeue timed out");
                return Ok(None);
            }
            let wait = remaining.min(self.config.poll_interval);
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[async_trait]
impl PlatformClient for Supervisor {
    async fn dequeue(&self) -> Result<Option<DequeuedMessage>> {
        self.dequeue_with_timeout(self.config.connection_timeout).await
    }

    async fn start_attempt(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        worker_id: &str,
        is_warm_start: bool,
    ) -> Result<AttemptExecution> {
        self.engine
            .start_attempt(run_id, snapshot_id, worker_id, is_warm_start)
            .await
    }

    async fn heartbeat(&self, run_id: Uuid, snapshot_id: Uuid) -> Result<ExecutionSnapshot> {
        self.engine.heartbeat(run_id, snapshot_id).await
    }

    async fn complete_attempt(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        completion: AttemptCompletion,
    ) -> Result<CompleteAttemptResult> {
        self.engine
            .complete_attempt(run_id, snapshot_id, completion)
            .await
    }

    async fn suspend(&self, run_id: Uuid, snapshot_id: Uuid) -> Result<SuspendOutcome> {
        self.engine.suspend(run_id, snapshot_id).await
    }

    async fn continue_run(&self, run_id: Uuid, snapshot_id: Uuid) -> Result<ExecutionSnapshot> {
        self.engine.continue_run_execution(run_id, snapshot_id).await
    }

    async fn wait_for_duration(
        &self,
        run_id: Uuid,
        snapshot_id: Uuid,
        completed_after: DateTime<Utc>,
    ) -> Result<Waitpoint> {
        self.engine
            .wait_for_duration(run_id, snapshot_id, completed_after)
            .await
    }

    async fn latest_snapshot(&self, run_id: Uuid) -> Result<ExecutionSnapshot> {
        let (_, snapshot) = self.engine.run_view(run_id).await?;
        Ok(snapshot)
    }

    fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<ExecutionSnapshot> {
        self.engine.notifier().subscribe(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EnvironmentType, RunEnvironment};
    use crate::engine::TriggerRequest;

    fn env() -> RunEnvironment {
        RunEnvironment::new("org_1", "proj_1", "env_1", EnvironmentType::Production)
    }

    #[tokio::test]
    async fn test_long_poll_times_out_empty() {
        let engine = Arc::new(RunEngine::in_memory());
        let master = engine.master_queue_key(&env(), Some("m"));
        let supervisor = Supervisor::new(engine, "c1", master);

        let started = tokio::time::Instant::now();
        let result = supervisor
            .dequeue_with_timeout(Duration::from_millis(120))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_trigger() {
        let engine = Arc::new(RunEngine::in_memory());
        let master = engine.master_queue_key(&env(), Some("m"));
        let supervisor = Supervisor::new(Arc::clone(&engine), "c1", master);

        let trigger_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger_engine
                .trigger(
                    TriggerRequest::new("hello", "{}", env()).with_master_queue("m"),
                )
                .await
                .unwrap();
        });

        let message = supervisor
            .dequeue_with_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(message.is_some());
    }
}
