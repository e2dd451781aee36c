//! In-memory run queue with the same semantics as the Redis backend.
//!
//! All state lives behind one mutex, which stands in for the Redis
//! single-threaded execution model: a claim observes and mutates every
//! counter in one critical section, so limits hold at the moment a dequeue
//! returns. Suitable for tests and embedded single-process deployments.

use super::keys::KeyProducer;
use super::priority::PriorityStrategy;
use super::{ms, QueueConfig, QueueError, Result, RunQueue};
use crate::core::{RunEnvironment, RunMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct QueueState {
    /// queue key → run ids ordered by (score, id).
    queues: HashMap<String, BTreeMap<(i64, Uuid), ()>>,
    /// master queue key → member queue keys.
    masters: HashMap<String, HashSet<String>>,
    /// run id → message body.
    messages: HashMap<Uuid, RunMessage>,
    /// currentConcurrency key → member run ids.
    concurrency: HashMap<String, HashSet<Uuid>>,
    /// concurrency-limit key → value.
    limits: HashMap<String, u32>,
    /// run id → consumer holding it in flight.
    owners: HashMap<Uuid, String>,
}

/// Process-local [`RunQueue`] implementation.
pub struct InMemoryRunQueue {
    keys: KeyProducer,
    config: QueueConfig,
    env_strategy: PriorityStrategy,
    queue_strategy: PriorityStrategy,
    state: Mutex<QueueState>,
}

impl InMemoryRunQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            keys: KeyProducer::new(config.prefix.clone()),
            config,
            env_strategy: PriorityStrategy::for_environments(),
            queue_strategy: PriorityStrategy::for_queues(),
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn keys(&self) -> &KeyProducer {
        &self.keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The four counter keys a claimed message occupies. The named-queue
    /// counter is always present; the ck counter only for sub-queues.
    fn counter_keys(&self, message: &RunMessage) -> Vec<String> {
        let env = message.environment();
        let named_queue = self.keys.queue_key(&env, &message.queue_name, None);
        let mut keys = vec![
            self.keys.env_current_concurrency_key(&env),
            self.keys.queue_current_concurrency_key(&named_queue),
            self.keys
                .task_current_concurrency_key(&env, &message.task_identifier),
        ];
        if let Some(ck) = &message.concurrency_key {
            let sub_queue = self.keys.queue_key(&env, &message.queue_name, Some(ck));
            keys.push(self.keys.queue_current_concurrency_key(&sub_queue));
        }
        keys
    }

    fn env_limit(&self, state: &QueueState, env: &RunEnvironment) -> u32 {
        state
            .limits
            .get(&self.keys.env_concurrency_limit_key(env))
            .copied()
            .unwrap_or(self.config.default_env_concurrency_limit)
    }

    fn queue_limit(&self, state: &QueueState, env: &RunEnvironment, queue_key: &str) -> u32 {
        state
            .limits
            .get(&self.keys.queue_concurrency_limit_key(queue_key))
            .copied()
            .unwrap_or_else(|| self.env_limit(state, env))
    }

    fn set_len(state: &QueueState, key: &str) -> usize {
        state.concurrency.get(key).map(HashSet::len).unwrap_or(0)
    }

    /// Checks all counters a message would occupy against their limits.
    fn under_limits(&self, state: &QueueState, message: &RunMessage) -> bool {
        let env = message.environment();
        if Self::set_len(state, &self.keys.env_current_concurrency_key(&env)) as u32
            >= self.env_limit(state, &env)
        {
            return false;
        }
        let named_queue = self.keys.queue_key(&env, &message.queue_name, None);
        let named_current = self
            .keys
            .queue_current_concurrency_key(&named_queue);
        if Self::set_len(state, &named_current) as u32 >= self.queue_limit(state, &env, &named_queue)
        {
            return false;
        }
        if let Some(ck) = &message.concurrency_key {
            let sub_queue = self.keys.queue_key(&env, &message.queue_name, Some(ck));
            let sub_current = self.keys.queue_current_concurrency_key(&sub_queue);
            let sub_limit = state
                .limits
                .get(&self.keys.queue_concurrency_limit_key(&sub_queue))
                .copied()
                .unwrap_or_else(|| self.queue_limit(state, &env, &named_queue));
            if Self::set_len(state, &sub_current) as u32 >= sub_limit {
                return false;
            }
        }
        let task_current = self
            .keys
            .task_current_concurrency_key(&env, &message.task_identifier);
        let task_limit_key = self
            .keys
            .task_concurrency_limit_key(&env, &message.task_identifier);
        if let Some(task_limit) = state.limits.get(&task_limit_key) {
            if Self::set_len(state, &task_current) as u32 >= *task_limit {
                return false;
            }
        }
        true
    }

    fn occupy(&self, state: &mut QueueState, message: &RunMessage) {
        for key in self.counter_keys(message) {
            state
                .concurrency
                .entry(key)
                .or_default()
                .insert(message.run_id);
        }
    }

    fn vacate(&self, state: &mut QueueState, message: &RunMessage) {
        for key in self.counter_keys(message) {
            if let Some(set) = state.concurrency.get_mut(&key) {
                set.remove(&message.run_id);
            }
        }
    }

    /// Pops the oldest available run from the queue if it passes every
    /// concurrency gate; mirrors the Redis claim script.
    fn try_claim(
        &self,
        state: &mut QueueState,
        queue_key: &str,
        consumer_id: &str,
        now_ms: i64,
    ) -> Option<RunMessage> {
        let entry = {
            let queue = state.queues.get(queue_key)?;
            let ((score, run_id), _) = queue.iter().next()?;
            if *score > now_ms {
                return None;
            }
            (*score, *run_id)
        };
        let message = state.messages.get(&entry.1)?.clone();
        if !self.under_limits(state, &message) {
            return None;
        }
        if let Some(queue) = state.queues.get_mut(queue_key) {
            queue.remove(&entry);
        }
        self.occupy(state, &message);
        state.owners.insert(message.run_id, consumer_id.to_string());
        Some(message)
    }
}

impl Default for InMemoryRunQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl RunQueue for InMemoryRunQueue {
    async fn enqueue_message(
        &self,
        env: &RunEnvironment,
        master_queue: &str,
        message: RunMessage,
    ) -> Result<()> {
        let mut message = message;
        message.master_queue = master_queue.to_string();
        let queue_key = self
            .keys
            .queue_key(env, &message.queue_name, message.concurrency_key.as_deref());
        let score = ms(message.available_at);
        let run_id = message.run_id;

        let mut state = self.lock();
        // One queue position per run: clear any previous entry first.
        if let Some(queue) = state.queues.get_mut(&queue_key) {
            queue.retain(|(_, id), _| *id != run_id);
        }
        state
            .queues
            .entry(queue_key.clone())
            .or_default()
            .insert((score, run_id), ());
        state
            .masters
            .entry(master_queue.to_string())
            .or_default()
            .insert(queue_key);
        state.messages.insert(run_id, message);
        debug!(run_id = %run_id, master_queue, "enqueued message");
        Ok(())
    }

    async fn dequeue_message_in_shared_queue(
        &self,
        consumer_id: &str,
        master_queue: &str,
    ) -> Result<Option<RunMessage>> {
        let now_ms = ms(Utc::now());
        let mut state = self.lock();

        // Candidate queues: non-empty members with an available head, oldest
        // first, capped at the scan limit.
        let mut candidates: Vec<(i64, String)> = state
            .masters
            .get(master_queue)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|queue_key| {
                        let queue = state.queues.get(queue_key)?;
                        let ((score, _), _) = queue.iter().next()?;
                        (*score <= now_ms).then(|| (*score, queue_key.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        candidates.sort();
        candidates.truncate(self.config.master_scan_limit);

        // Group by environment, dropping environments already at their cap.
        let mut by_env: HashMap<String, Vec<String>> = HashMap::new();
        let mut env_order: Vec<String> = Vec::new();
        for (_, queue_key) in &candidates {
            let descriptor = self.keys.parse_queue_key(queue_key)?;
            let env = descriptor.environment();
            let env_prefix = self.keys.env_prefix(&env);
            let current =
                Self::set_len(&state, &self.keys.env_current_concurrency_key(&env)) as u32;
            if current >= self.env_limit(&state, &env) {
                continue;
            }
            if !by_env.contains_key(&env_prefix) {
                env_order.push(env_prefix.clone());
            }
            by_env.entry(env_prefix).or_default().push(queue_key.clone());
        }

        while !env_order.is_empty() {
            let Some(env_prefix) = self.env_strategy.choose(&env_order) else {
                break;
            };
            let mut queues = by_env.remove(&env_prefix).unwrap_or_default();
            env_order.retain(|e| *e != env_prefix);

            while !queues.is_empty() {
                let Some(queue_key) = self.queue_strategy.choose(&queues) else {
                    break;
                };
                if let Some(message) = self.try_claim(&mut state, &queue_key, consumer_id, now_ms)
                {
                    debug!(run_id = %message.run_id, queue = %queue_key, consumer_id, "dequeued message");
                    return Ok(Some(message));
                }
                queues.retain(|q| *q != queue_key);
            }
        }

        Ok(None)
    }

    async fn acknowledge_message(&self, run_id: Uuid) -> Result<()> {
        let mut state = self.lock();
        let Some(message) = state.messages.remove(&run_id) else {
            return Ok(());
        };
        let env = message.environment();
        let queue_key = self.keys.queue_key(
            &env,
            &message.queue_name,
            message.concurrency_key.as_deref(),
        );
        if let Some(queue) = state.queues.get_mut(&queue_key) {
            queue.retain(|(_, id), _| *id != run_id);
        }
        self.vacate(&mut state, &message);
        state.owners.remove(&run_id);
        Ok(())
    }

    async fn nack_message(&self, run_id: Uuid, retry_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut state = self.lock();
        let Some(message) = state.messages.get(&run_id).cloned() else {
            return Ok(());
        };
        self.vacate(&mut state, &message);
        state.owners.remove(&run_id);

        let env = message.environment();
        let queue_key = self.keys.queue_key(
            &env,
            &message.queue_name,
            message.concurrency_key.as_deref(),
        );
        let score = ms(retry_at.unwrap_or_else(Utc::now));
        let queue = state.queues.entry(queue_key.clone()).or_default();
        queue.retain(|(_, id), _| *id != run_id);
        queue.insert((score, run_id), ());
        state
            .masters
            .entry(message.master_queue.clone())
            .or_default()
            .insert(queue_key);
        Ok(())
    }

    async fn release_concurrency(&self, run_id: Uuid) -> Result<()> {
        let mut state = self.lock();
        let Some(message) = state.messages.get(&run_id).cloned() else {
            return Ok(());
        };
        self.vacate(&mut state, &message);
        state.owners.remove(&run_id);
        Ok(())
    }

    async fn reacquire_concurrency(&self, run_id: Uuid) -> Result<bool> {
        let mut state = self.lock();
        let Some(message) = state.messages.get(&run_id).cloned() else {
            return Err(QueueError::MessageNotFound(run_id));
        };
        if !self.under_limits(&state, &message) {
            return Ok(false);
        }
        self.occupy(&mut state, &message);
        Ok(true)
    }

    async fn update_queue_concurrency_limits(
        &self,
        env: &RunEnvironment,
        queue: &str,
        limit: u32,
    ) -> Result<()> {
        let queue_key = self.keys.queue_key(env, queue, None);
        let limit_key = self.keys.queue_concurrency_limit_key(&queue_key);
        self.lock().limits.insert(limit_key, limit);
        Ok(())
    }

    async fn remove_queue_concurrency_limits(
        &self,
        env: &RunEnvironment,
        queue: &str,
    ) -> Result<()> {
        let queue_key = self.keys.queue_key(env, queue, None);
        let limit_key = self.keys.queue_concurrency_limit_key(&queue_key);
        self.lock().limits.remove(&limit_key);
        Ok(())
    }

    async fn update_env_concurrency_limits(&self, env: &RunEnvironment, limit: u32) -> Result<()> {
        let limit_key = self.keys.env_concurrency_limit_key(env);
        self.lock().limits.insert(limit_key, limit);
        Ok(())
    }

    async fn read_message(&self, run_id: Uuid) -> Result<Option<RunMessage>> {
        Ok(self.lock().messages.get(&run_id).cloned())
    }

    async fn queue_length(
        &self,
        env: &RunEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> Result<usize> {
        let queue_key = self.keys.queue_key(env, queue, concurrency_key);
        Ok(self
            .lock()
            .queues
            .get(&queue_key)
            .map(BTreeMap::len)
            .unwrap_or(0))
    }

    async fn current_concurrency(
        &self,
        env: &RunEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> Result<usize> {
        let queue_key = self.keys.queue_key(env, queue, concurrency_key);
        let current_key = self.keys.queue_current_concurrency_key(&queue_key);
        Ok(Self::set_len(&self.lock(), &current_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EnvironmentType;

    fn env() -> RunEnvironment {
        RunEnvironment::new("org_1", "proj_1", "env_1", EnvironmentType::Production)
    }

    fn message(queue: &str, ck: Option<&str>) -> RunMessage {
        let now = Utc::now();
        RunMessage {
            run_id: Uuid::new_v4(),
            task_identifier: "hello".into(),
            organization_id: "org_1".into(),
            project_id: "proj_1".into(),
            environment_id: "env_1".into(),
            environment_type: EnvironmentType::Production,
            queue_name: queue.into(),
            concurrency_key: ck.map(Into::into),
            master_queue: String::new(),
            enqueued_at: now,
            available_at: now,
            attempt_count: 0,
        }
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_ack() {
        let queue = InMemoryRunQueue::default();
        let msg = message("default", None);
        let run_id = msg.run_id;

        queue.enqueue_message(&env(), "m", msg).await.unwrap();
        assert_eq!(queue.queue_length(&env(), "default", None).await.unwrap(), 1);

        let dequeued = queue
            .dequeue_message_in_shared_queue("c1", "m")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dequeued.run_id, run_id);
        assert_eq!(queue.current_concurrency(&env(), "default", None).await.unwrap(), 1);

        queue.acknowledge_message(run_id).await.unwrap();
        assert_eq!(queue.current_concurrency(&env(), "default", None).await.unwrap(), 0);
        assert!(queue.read_message(run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let queue = InMemoryRunQueue::default();
        let msg = message("default", None);
        let run_id = msg.run_id;
        queue.enqueue_message(&env(), "m", msg).await.unwrap();
        queue
            .dequeue_message_in_shared_queue("c1", "m")
            .await
            .unwrap()
            .unwrap();

        queue.acknowledge_message(run_id).await.unwrap();
        queue.acknowledge_message(run_id).await.unwrap();
        assert_eq!(queue.current_concurrency(&env(), "default", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_concurrency_limit_gates_dequeue() {
        let queue = InMemoryRunQueue::default();
        queue
            .update_queue_concurrency_limits(&env(), "serial", 1)
            .await
            .unwrap();

        let first = message("serial", None);
        let second = message("serial", None);
        queue.enqueue_message(&env(), "m", first).await.unwrap();
        queue.enqueue_message(&env(), "m", second).await.unwrap();

        let held = queue
            .dequeue_message_in_shared_queue("c1", "m")
            .await
            .unwrap()
            .unwrap();
        // Second dequeue blocked by the limit.
        assert!(queue
            .dequeue_message_in_shared_queue("c1", "m")
            .await
            .unwrap()
            .is_none());

        queue.acknowledge_message(held.run_id).await.unwrap();
        assert!(queue
            .dequeue_message_in_shared_queue("c1", "m")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_concurrency_key_partitions_queue() {
        let queue = InMemoryRunQueue::default();
        // Sub-queue limit of 1 per concurrency key, queue-wide limit of 10.
        queue
            .update_queue_concurrency_limits(&env(), "per-user", 10)
            .await
            .unwrap();
        let sub_queue_key = queue.keys().queue_key(&env(), "per-user", Some("u1"));
        let limit_key = queue.keys().queue_concurrency_limit_key(&sub_queue_key);
        queue.lock().limits.insert(limit_key, 1);

        let a = message("per-user", Some("u1"));
        let b = message("per-user", Some("u1"));
        let c = message("per-user", Some("u2"));
        queue.enqueue_message(&env(), "m", a).await.unwrap();
        queue.enqueue_message(&env(), "m", b).await.unwrap();
        queue.enqueue_message(&env(), "m", c).await.unwrap();

        let mut got = Vec::new();
        while let Some(msg) = queue
            .dequeue_message_in_shared_queue("c1", "m")
            .await
            .unwrap()
        {
            got.push(msg.concurrency_key.clone().unwrap());
        }
        got.sort();
        // One u1 message held back by the sub-queue cap.
        assert_eq!(got, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[tokio::test]
    async fn test_nack_requeues_and_frees_concurrency() {
        let queue = InMemoryRunQueue::default();
        let msg = message("default", None);
        let run_id = msg.run_id;
        queue.enqueue_message(&env(), "m", msg).await.unwrap();
        queue
            .dequeue_message_in_shared_queue("c1", "m")
            .await
            .unwrap()
            .unwrap();

        queue.nack_message(run_id, None).await.unwrap();
        assert_eq!(queue.current_concurrency(&env(), "default", None).await.unwrap(), 0);
        let again = queue
            .dequeue_message_in_shared_queue("c2", "m")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.run_id, run_id);
    }

    #[tokio::test]
    async fn test_release_and_reacquire_concurrency() {
        let queue = InMemoryRunQueue::default();
        queue
            .update_queue_concurrency_limits(&env(), "serial", 1)
            .await
            .unwrap();
        let msg = message("serial", None);
        let run_id = msg.run_id;
        queue.enqueue_message(&env(), "m", msg).await.unwrap();
        queue
            .dequeue_message_in_shared_queue("c1", "m")
            .await
            .unwrap()
            .unwrap();

        queue.release_concurrency(run_id).await.unwrap();
        assert_eq!(queue.current_concurrency(&env(), "serial", None).await.unwrap(), 0);
        // Body survives release so the run can be re-queued later.
        assert!(queue.read_message(run_id).await.unwrap().is_some());

        assert!(queue.reacquire_concurrency(run_id).await.unwrap());
        assert_eq!(queue.current_concurrency(&env(), "serial", None).await.unwrap(), 1);

        // A second run cannot reacquire past the limit.
        let other = message("serial", None);
        let other_id = other.run_id;
        queue.enqueue_message(&env(), "m", other).await.unwrap();
        assert!(!queue.reacquire_concurrency(other_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_env_concurrency_limit_spans_queues() {
        let queue = InMemoryRunQueue::default();
        queue.update_env_concurrency_limits(&env(), 1).await.unwrap();

        let a = message("alpha", None);
        let b = message("beta", None);
        queue.enqueue_message(&env(), "m", a).await.unwrap();
        queue.enqueue_message(&env(), "m", b).await.unwrap();

        let held = queue
            .dequeue_message_in_shared_queue("c1", "m")
            .await
            .unwrap()
            .unwrap();
        // The env cap is shared across both queues.
        assert!(queue
            .dequeue_message_in_shared_queue("c1", "m")
            .await
            .unwrap()
            .is_none());

        queue.acknowledge_message(held.run_id).await.unwrap();
        assert!(queue
            .dequeue_message_in_shared_queue("c1", "m")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_future_available_at_is_invisible() {
        let queue = InMemoryRunQueue::default();
        let mut msg = message("default", None);
        msg.available_at = Utc::now() + chrono::Duration::seconds(60);
        queue.enqueue_message(&env(), "m", msg).await.unwrap();

        assert!(queue
            .dequeue_message_in_shared_queue("c1", "m")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_env_isolation_between_masters() {
        let queue = InMemoryRunQueue::default();
        let msg = message("default", None);
        queue.enqueue_message(&env(), "m1", msg).await.unwrap();

        assert!(queue
            .dequeue_message_in_shared_queue("c1", "m2")
            .await
            .unwrap()
            .is_none());
        assert!(queue
            .dequeue_message_in_shared_queue("c1", "m1")
            .await
            .unwrap()
            .is_some());
    }
}
