//! Background worker that drains the delayed-job queue.
//!
//! # Lifecycle
//! 1. Create: `DelayedJobWorker::new(queue, handler)`
//! 2. Configure: `.with_poll_interval(duration)`
//! 3. Start: `.start()` returns a handle
//! 4. Shutdown: `handle.shutdown().await`

use super::{ClaimedJob, DelayedJob, DelayedJobQueue, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receiver for fired delayed jobs; implemented by the run engine.
#[async_trait]
pub trait DelayedJobHandler: Send + Sync {
    /// Handles one job. An error nacks the job for a later retry.
    async fn handle(&self, job: DelayedJob) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Polls the delayed-job queue and dispatches ready jobs to the handler.
pub struct DelayedJobWorker {
    queue: Arc<dyn DelayedJobQueue>,
    handler: Arc<dyn DelayedJobHandler>,
    poll_interval: Duration,
    batch_size: usize,
    retry_delay: Duration,
}

impl DelayedJobWorker {
    pub fn new(queue: Arc<dyn DelayedJobQueue>, handler: Arc<dyn DelayedJobHandler>) -> Self {
        Self {
            queue,
            handler,
            poll_interval: Duration::from_millis(500),
            batch_size: 32,
            retry_delay: Duration::from_secs(2),
        }
    }

    /// Sets the poll interval for checking ready jobs.
    ///
    /// Lower intervals give better timer precision at higher cost.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Starts the worker in a background task.
    pub fn start(self) -> DelayedJobWorkerHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            info!(poll_interval = ?self.poll_interval, "delayed-job worker started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {
                        if let Err(e) = self.drain_ready().await {
                            // Keep polling; jobs stay durable in the queue.
                            error!("delayed-job poll failed: {e}");
                        }
                    }
                }
            }
            info!("delayed-job worker stopped cleanly");
        });

        DelayedJobWorkerHandle { handle, shutdown }
    }

    async fn drain_ready(&self) -> Result<()> {
        let claimed = self.queue.claim_ready(Utc::now(), self.batch_size).await?;
        if !claimed.is_empty() {
            debug!("claimed {} ready delayed jobs", claimed.len());
        }
        for claim in claimed {
            self.dispatch(claim).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, claim: ClaimedJob) -> Result<()> {
        let ClaimedJob { job, job_id } = claim;
        let kind = job.kind();
        match self.handler.handle(job).await {
            Ok(()) => self.queue.ack(&job_id).await,
            Err(e) => {
                warn!(job_id, kind, "delayed job failed (will retry): {e}");
                let retry_at =
                    Utc::now() + ChronoDuration::milliseconds(self.retry_delay.as_millis() as i64);
                self.queue.nack(&job_id, retry_at).await
            }
        }
    }
}

/// Handle for stopping the delayed-job worker.
pub struct DelayedJobWorkerHandle {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl DelayedJobWorkerHandle {
    /// Gracefully shuts the worker down, waiting for in-flight dispatches.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delayed::InMemoryDelayedJobQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingHandler {
        handled: AtomicUsize,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl DelayedJobHandler for CountingHandler {
        async fn handle(
            &self,
            _job: DelayedJob,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err("transient".into());
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_worker_dispatches_ready_jobs() {
        let queue = Arc::new(InMemoryDelayedJobQueue::new());
        let handler = Arc::new(CountingHandler {
            handled: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(0),
        });
        queue
            .enqueue(
                DelayedJob::ExpireRun {
                    run_id: Uuid::new_v4(),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let worker = DelayedJobWorker::new(queue, handler.clone())
            .with_poll_interval(Duration::from_millis(20));
        let handle = worker.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown().await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_job_is_nacked_and_retried() {
        let queue = Arc::new(InMemoryDelayedJobQueue::new());
        let handler = Arc::new(CountingHandler {
            handled: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(1),
        });
        queue
            .enqueue(
                DelayedJob::ExpireRun {
                    run_id: Uuid::new_v4(),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let mut worker = DelayedJobWorker::new(queue, handler.clone())
            .with_poll_interval(Duration::from_millis(20));
        worker.retry_delay = Duration::from_millis(50);
        let handle = worker.start();

        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.shutdown().await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }
}
