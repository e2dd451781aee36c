//! Process-local delayed-job queue.

use super::{ClaimedJob, DelayedJob, DelayedJobQueue, Result, DEFAULT_VISIBILITY_TIMEOUT};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct DelayedState {
    /// job id → (available_at ms, job).
    pending: HashMap<String, (i64, DelayedJob)>,
    /// job id → (claim expiry ms, job).
    claimed: HashMap<String, (i64, DelayedJob)>,
}

/// In-memory [`DelayedJobQueue`] with the same visibility-timeout shape as
/// the Redis backend.
pub struct InMemoryDelayedJobQueue {
    visibility_timeout: Duration,
    state: Mutex<DelayedState>,
}

impl InMemoryDelayedJobQueue {
    pub fn new() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            state: Mutex::new(DelayedState::default()),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DelayedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryDelayedJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DelayedJobQueue for InMemoryDelayedJobQueue {
    async fn enqueue(&self, job: DelayedJob, available_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        let job_id = job.job_id();
        state.claimed.remove(&job_id);
        state
            .pending
            .insert(job_id, (available_at.timestamp_millis(), job));
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        self.lock().pending.remove(job_id);
        Ok(())
    }

    async fn claim_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ClaimedJob>> {
        let now_ms = now.timestamp_millis();
        let expiry_ms = (now
            + ChronoDuration::milliseconds(self.visibility_timeout.as_millis() as i64))
        .timestamp_millis();
        let mut state = self.lock();

        // Expired claims first: a worker that died mid-job loses its claim.
        let expired: Vec<String> = state
            .claimed
            .iter()
            .filter(|(_, (claim_expiry, _))| *claim_expiry <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some((_, job)) = state.claimed.remove(&id) {
                state.pending.insert(id, (now_ms, job));
            }
        }

        let mut ready: Vec<(i64, String)> = state
            .pending
            .iter()
            .filter(|(_, (available_at, _))| *available_at <= now_ms)
            .map(|(id, (available_at, _))| (*available_at, id.clone()))
            .collect();
        ready.sort();
        ready.truncate(limit);

        let mut claims = Vec::with_capacity(ready.len());
        for (_, job_id) in ready {
            if let Some((_, job)) = state.pending.remove(&job_id) {
                state.claimed.insert(job_id.clone(), (expiry_ms, job.clone()));
                claims.push(ClaimedJob { job, job_id });
            }
        }
        Ok(claims)
    }

    async fn ack(&self, job_id: &str) -> Result<()> {
        self.lock().claimed.remove(job_id);
        Ok(())
    }

    async fn nack(&self, job_id: &str, retry_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        if let Some((_, job)) = state.claimed.remove(job_id) {
            state
                .pending
                .insert(job_id.to_string(), (retry_at.timestamp_millis(), job));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn job() -> DelayedJob {
        DelayedJob::ExpireRun {
            run_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_claim_respects_available_at() {
        let queue = InMemoryDelayedJobQueue::new();
        let now = Utc::now();
        queue
            .enqueue(job(), now + ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert!(queue.claim_ready(now, 10).await.unwrap().is_empty());
        assert_eq!(
            queue
                .claim_ready(now + ChronoDuration::seconds(61), 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_scheduling_collapses() {
        let queue = InMemoryDelayedJobQueue::new();
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        let job = DelayedJob::ExpireRun { run_id };
        queue.enqueue(job.clone(), now).await.unwrap();
        queue.enqueue(job, now).await.unwrap();
        assert_eq!(queue.claim_ready(now, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_visibility_timeout_reclaims() {
        let queue =
            InMemoryDelayedJobQueue::new().with_visibility_timeout(Duration::from_millis(100));
        let now = Utc::now();
        queue.enqueue(job(), now).await.unwrap();

        let claimed = queue.claim_ready(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        // Invisible while claimed...
        assert!(queue.claim_ready(now, 10).await.unwrap().is_empty());
        // ...claimable again after the timeout.
        let later = now + ChronoDuration::milliseconds(150);
        assert_eq!(queue.claim_ready(later, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ack_removes_and_cancel_drops_pending() {
        let queue = InMemoryDelayedJobQueue::new();
        let now = Utc::now();
        let j = job();
        let job_id = j.job_id();
        queue.enqueue(j.clone(), now).await.unwrap();

        let claimed = queue.claim_ready(now, 10).await.unwrap();
        queue.ack(&claimed[0].job_id).await.unwrap();
        let later = now + ChronoDuration::seconds(60);
        assert!(queue.claim_ready(later, 10).await.unwrap().is_empty());

        queue.enqueue(j, now).await.unwrap();
        queue.cancel(&job_id).await.unwrap();
        assert!(queue.claim_ready(later, 10).await.unwrap().is_empty());
    }
}
