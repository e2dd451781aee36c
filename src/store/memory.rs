//! In-memory run store using DashMap for concurrent access.
//!
//! DashMap provides concurrent access through sharding, so independent runs
//! never contend. Waitpoint completion crosses several maps and takes a
//! dedicated mutex to stay transactional.

use super::{Result, RunStore, StoreError, WaitpointCompletion};
use crate::core::{
    Attempt, ExecutionSnapshot, Run, RunError, RunStatus, RunWaitpoint, TaskQueue, Waitpoint,
    WaitpointStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Process-local [`RunStore`] implementation.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: DashMap<Uuid, Run>,
    snapshots: DashMap<Uuid, Vec<ExecutionSnapshot>>,
    attempts: DashMap<Uuid, Vec<Attempt>>,
    waitpoints: DashMap<Uuid, Waitpoint>,
    /// run id → waitpoint ids blocking it.
    run_waitpoints: DashMap<Uuid, HashSet<Uuid>>,
    task_queues: DashMap<(String, String), TaskQueue>,
    /// Serializes waitpoint completion across maps.
    completion_lock: Mutex<()>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert_run(&self, run: &Run) -> Result<()> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(self.runs.get(&id).map(|r| r.clone()))
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        if !self.runs.contains_key(&run.id) {
            return Err(StoreError::RunNotFound(run.id));
        }
        let mut run = run.clone();
        run.updated_at = Utc::now();
        self.runs.insert(run.id, run);
        Ok(())
    }

    async fn find_run_by_idempotency_key(
        &self,
        environment_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Run>> {
        Ok(self
            .runs
            .iter()
            .find(|entry| {
                entry.environment.environment_id == environment_id
                    && entry.idempotency_key.as_deref() == Some(idempotency_key)
                    && !entry.status.is_terminal()
            })
            .map(|entry| entry.clone()))
    }

    async fn create_attempt(&self, run_id: Uuid) -> Result<Attempt> {
        let mut run = self
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        run.attempt_count += 1;
        run.updated_at = Utc::now();
        let attempt = Attempt {
            id: Uuid::new_v4(),
            run_id,
            number: run.attempt_count,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        };
        drop(run);
        self.attempts
            .entry(run_id)
            .or_default()
            .push(attempt.clone());
        Ok(attempt)
    }

    async fn finalize_attempt(&self, attempt_id: Uuid, error: Option<RunError>) -> Result<()> {
        for mut entry in self.attempts.iter_mut() {
            if let Some(attempt) = entry.iter_mut().find(|a| a.id == attempt_id) {
                attempt.completed_at = Some(Utc::now());
                attempt.error = error;
                return Ok(());
            }
        }
        Err(StoreError::AttemptNotFound(attempt_id))
    }

    async fn attempts_for_run(&self, run_id: Uuid) -> Result<Vec<Attempt>> {
        Ok(self
            .attempts
            .get(&run_id)
            .map(|a| a.clone())
            .unwrap_or_default())
    }

    async fn append_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<()> {
        self.snapshots
            .entry(snapshot.run_id)
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn latest_snapshot(&self, run_id: Uuid) -> Result<Option<ExecutionSnapshot>> {
        Ok(self
            .snapshots
            .get(&run_id)
            .and_then(|s| s.last().cloned()))
    }

    async fn snapshots_for_run(&self, run_id: Uuid) -> Result<Vec<ExecutionSnapshot>> {
        Ok(self
            .snapshots
            .get(&run_id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    async fn insert_waitpoint(&self, waitpoint: &Waitpoint) -> Result<()> {
        self.waitpoints.insert(waitpoint.id, waitpoint.clone());
        Ok(())
    }

    async fn get_waitpoint(&self, id: Uuid) -> Result<Option<Waitpoint>> {
        Ok(self.waitpoints.get(&id).map(|w| w.clone()))
    }

    async fn get_waitpoints(&self, ids: &[Uuid]) -> Result<Vec<Waitpoint>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.waitpoints.get(id).map(|w| w.clone()))
            .collect())
    }

    async fn block_run_with_waitpoint(
        &self,
        run_id: Uuid,
        waitpoint_id: Uuid,
        _project_id: &str,
    ) -> Result<()> {
        self.run_waitpoints
            .entry(run_id)
            .or_default()
            .insert(waitpoint_id);
        Ok(())
    }

    async fn waitpoints_blocking_run(&self, run_id: Uuid) -> Result<Vec<RunWaitpoint>> {
        let project_id = self
            .runs
            .get(&run_id)
            .map(|r| r.environment.project_id.clone())
            .unwrap_or_default();
        Ok(self
            .run_waitpoints
            .get(&run_id)
            .map(|set| {
                set.iter()
                    .map(|waitpoint_id| RunWaitpoint {
                        run_id,
                        waitpoint_id: *waitpoint_id,
                        project_id: project_id.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn unblock_run_from_waitpoint(&self, run_id: Uuid, waitpoint_id: Uuid) -> Result<()> {
        if let Some(mut set) = self.run_waitpoints.get_mut(&run_id) {
            set.remove(&waitpoint_id);
        }
        Ok(())
    }

    async fn clear_run_waitpoints(&self, run_id: Uuid) -> Result<()> {
        self.run_waitpoints.remove(&run_id);
        Ok(())
    }

    async fn complete_waitpoint(
        &self,
        id: Uuid,
        output: Option<String>,
        output_is_error: bool,
    ) -> Result<Option<WaitpointCompletion>> {
        let _guard = self.completion_lock.lock().await;

        let waitpoint = {
            let mut entry = self
                .waitpoints
                .get_mut(&id)
                .ok_or(StoreError::WaitpointNotFound(id))?;
            if entry.status == WaitpointStatus::Completed {
                return Ok(None);
            }
            entry.status = WaitpointStatus::Completed;
            entry.output = output;
            entry.output_is_error = output_is_error;
            entry.completed_at = Some(Utc::now());
            entry.clone()
        };

        let mut unblocked_run_ids = Vec::new();
        for mut entry in self.run_waitpoints.iter_mut() {
            if entry.remove(&id) && entry.is_empty() {
                unblocked_run_ids.push(*entry.key());
            }
        }

        Ok(Some(WaitpointCompletion {
            waitpoint,
            unblocked_run_ids,
        }))
    }

    async fn upsert_task_queue(&self, queue: &TaskQueue) -> Result<()> {
        self.task_queues.insert(
            (queue.environment_id.clone(), queue.name.clone()),
            queue.clone(),
        );
        Ok(())
    }

    async fn get_task_queue(&self, environment_id: &str, name: &str) -> Result<Option<TaskQueue>> {
        Ok(self
            .task_queues
            .get(&(environment_id.to_string(), name.to_string()))
            .map(|q| q.clone()))
    }

    async fn runs_waiting_to_resume_since(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::WaitingToResume && r.updated_at < cutoff)
            .map(|r| r.clone())
            .collect();
        runs.sort_by_key(|r| r.updated_at);
        runs.truncate(limit);
        Ok(runs)
    }
}
