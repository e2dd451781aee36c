//! Redis-backed run queue with async pool and atomic claim scripts.
//!
//! This backend enables supervisors on separate machines to share one set
//! of queues. Candidate *selection* (which environment, which queue) runs
//! platform-side against a snapshot of the master queue; the *claim* — limit
//! re-checks, pop, concurrency increments, in-flight record, master-queue
//! maintenance — is a single Lua script, so counters can never exceed their
//! limits at the moment a dequeue returns.
//!
//! # Data Structures
//!
//! - `{p}masterQueue:{name}` / shared-queue keys (ZSET): member queue keys,
//!   score = the head message's availability timestamp
//! - `{p}org:…:queue:{q}[:ck:{k}]` (ZSET): run ids by availability score
//! - `{p}…:currentConcurrency` (SET): run ids currently holding a slot
//! - `{p}…:concurrency` (STRING): optional limit override
//! - `{p}message:{run_id}` (STRING): message body JSON (survives suspension)
//! - `{p}message:{run_id}:owner` (STRING): consumer holding the run
//! - `{p}inflight:{consumer}` (SET): run ids held by one consumer

use super::keys::KeyProducer;
use super::priority::PriorityStrategy;
use super::{ms, QueueConfig, QueueError, Result, RunQueue};
use crate::core::{deserialize_value, serialize_value, RunEnvironment, RunMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Atomic claim: re-check every concurrency gate, pop the head run, take its
/// slots, record the in-flight owner and refresh the master-queue score.
///
/// KEYS: [1] queue, [2] env current, [3] env limit, [4] named-queue current,
/// [5] named-queue limit, [6] ck current, [7] ck limit, [8] master queue,
/// [9] inflight set
/// ARGV: [1] now_ms, [2] default env limit, [3] message key prefix,
/// [4] consumer id, [5] has_ck flag, [6] task key prefix
const CLAIM_SCRIPT: &str = r#"
    local head = redis.call('ZRANGEBYSCORE', KEYS[1], 0, ARGV[1], 'LIMIT', 0, 1)
    if #head == 0 then
        return nil
    end
    local run_id = head[1]

    local env_limit = tonumber(redis.call('GET', KEYS[3]) or ARGV[2])
    if redis.call('SCARD', KEYS[2]) >= env_limit then
        return nil
    end

    local queue_limit = tonumber(redis.call('GET', KEYS[5]) or env_limit)
    if redis.call('SCARD', KEYS[4]) >= queue_limit then
        return nil
    end

    if ARGV[5] == '1' then
        local ck_limit = tonumber(redis.call('GET', KEYS[7]) or queue_limit)
        if redis.call('SCARD', KEYS[6]) >= ck_limit then
            return nil
        end
    end

    local body = redis.call('GET', ARGV[3] .. run_id)
    if not body then
        -- Orphaned id with no body: drop it rather than hand out garbage.
        redis.call('ZREM', KEYS[1], run_id)
        return nil
    end
    local message = cjson.decode(body)
    local task_current = ARGV[6] .. message['task_identifier'] .. ':currentConcurrency'
    local task_limit = redis.call('GET', ARGV[6] .. message['task_identifier'] .. ':concurrency')
    if task_limit and redis.call('SCARD', task_current) >= tonumber(task_limit) then
        return nil
    end

    redis.call('ZREM', KEYS[1], run_id)
    redis.call('SADD', KEYS[2], run_id)
    redis.call('SADD', KEYS[4], run_id)
    if ARGV[5] == '1' then
        redis.call('SADD', KEYS[6], run_id)
    end
    redis.call('SADD', task_current, run_id)
    redis.call('SADD', KEYS[9], run_id)
    redis.call('SET', ARGV[3] .. run_id .. ':owner', ARGV[4])

    local next_head = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
    if #next_head == 0 then
        redis.call('ZREM', KEYS[8], KEYS[1])
    else
        redis.call('ZADD', KEYS[8], next_head[2], KEYS[1])
    end
    return body
"#;

/// Write the message body, insert the run into its queue and publish
/// master-queue membership with the queue's head score.
///
/// KEYS: [1] message key, [2] queue, [3] master queue
/// ARGV: [1] body, [2] score, [3] run id
const ENQUEUE_SCRIPT: &str = r#"
    redis.call('SET', KEYS[1], ARGV[1])
    redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
    local head = redis.call('ZRANGE', KEYS[2], 0, 0, 'WITHSCORES')
    redis.call('ZADD', KEYS[3], head[2], KEYS[2])
    return redis.status_reply('OK')
"#;

/// Remove a run from its queue and all concurrency sets, drop its in-flight
/// record, and optionally delete the body / re-insert with a new score.
///
/// KEYS: [1] queue, [2] env current, [3] named current, [4] ck current,
/// [5] task current, [6] message key, [7] owner key, [8] master queue
/// ARGV: [1] run id, [2] inflight prefix,
/// [3] mode: "ack" | "nack" | "release", [4] nack score
const SETTLE_SCRIPT: &str = r#"
    local run_id = ARGV[1]
    redis.call('SREM', KEYS[2], run_id)
    redis.call('SREM', KEYS[3], run_id)
    redis.call('SREM', KEYS[4], run_id)
    redis.call('SREM', KEYS[5], run_id)
    local owner = redis.call('GET', KEYS[7])
    if owner then
        redis.call('SREM', ARGV[2] .. owner, run_id)
        redis.call('DEL', KEYS[7])
    end

    if ARGV[3] == 'ack' then
        redis.call('ZREM', KEYS[1], run_id)
        redis.call('DEL', KEYS[6])
    elseif ARGV[3] == 'nack' then
        redis.call('ZADD', KEYS[1], ARGV[4], run_id)
    end

    local head = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
    if #head == 0 then
        redis.call('ZREM', KEYS[8], KEYS[1])
    else
        redis.call('ZADD', KEYS[8], head[2], KEYS[1])
    end
    return redis.status_reply('OK')
"#;

/// Re-take the concurrency slots released at suspension, failing if any
/// limit would be exceeded.
///
/// KEYS: [1] env current, [2] env limit, [3] named current, [4] named limit,
/// [5] ck current, [6] ck limit, [7] task current, [8] task limit
/// ARGV: [1] run id, [2] default env limit, [3] has_ck flag
const REACQUIRE_SCRIPT: &str = r#"
    local env_limit = tonumber(redis.call('GET', KEYS[2]) or ARGV[2])
    if redis.call('SCARD', KEYS[1]) >= env_limit then
        return 0
    end
    local queue_limit = tonumber(redis.call('GET', KEYS[4]) or env_limit)
    if redis.call('SCARD', KEYS[3]) >= queue_limit then
        return 0
    end
    if ARGV[3] == '1' then
        local ck_limit = tonumber(redis.call('GET', KEYS[6]) or queue_limit)
        if redis.call('SCARD', KEYS[5]) >= ck_limit then
            return 0
        end
    end
    local task_limit = redis.call('GET', KEYS[8])
    if task_limit and redis.call('SCARD', KEYS[7]) >= tonumber(task_limit) then
        return 0
    end

    redis.call('SADD', KEYS[1], ARGV[1])
    redis.call('SADD', KEYS[3], ARGV[1])
    if ARGV[3] == '1' then
        redis.call('SADD', KEYS[5], ARGV[1])
    end
    redis.call('SADD', KEYS[7], ARGV[1])
    return 1
"#;

/// Redis [`RunQueue`] using async connection pooling.
pub struct RedisRunQueue {
    pool: Pool,
    keys: KeyProducer,
    config: QueueConfig,
    env_strategy: PriorityStrategy,
    queue_strategy: PriorityStrategy,
}

impl RedisRunQueue {
    /// Creates a new Redis run queue with connection pooling.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str, config: QueueConfig) -> Result<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            keys: KeyProducer::new(config.prefix.clone()),
            config,
            env_strategy: PriorityStrategy::for_environments(),
            queue_strategy: PriorityStrategy::for_queues(),
        })
    }

    pub fn keys(&self) -> &KeyProducer {
        &self.keys
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    fn message_owner_key(&self, run_id: Uuid) -> String {
        format!("{}:owner", self.keys.message_key(run_id))
    }

    fn inflight_prefix(&self) -> String {
        format!("{}inflight:", self.keys.prefix())
    }

    fn task_key_prefix(&self, env: &RunEnvironment) -> String {
        format!("{}:task:", self.keys.env_prefix(env))
    }

    /// Runs the settle script for ack / nack / release against the keys a
    /// stored message occupies.
    async fn settle(&self, message: &RunMessage, mode: &str, nack_score: i64) -> Result<()> {
        let env = message.environment();
        let queue_key = self
            .keys
            .queue_key(&env, &message.queue_name, message.concurrency_key.as_deref());
        let named_queue = self.keys.queue_key(&env, &message.queue_name, None);
        // Without a ck the sub-queue counter aliases the named counter; the
        // duplicate SREM is harmless.
        let ck_current = message
            .concurrency_key
            .as_deref()
            .map(|ck| {
                let sub = self.keys.queue_key(&env, &message.queue_name, Some(ck));
                self.keys.queue_current_concurrency_key(&sub)
            })
            .unwrap_or_else(|| self.keys.queue_current_concurrency_key(&named_queue));

        let mut conn = self.get_connection().await?;
        let _: () = redis::Script::new(SETTLE_SCRIPT)
            .key(&queue_key)
            .key(self.keys.env_current_concurrency_key(&env))
            .key(self.keys.queue_current_concurrency_key(&named_queue))
            .key(&ck_current)
            .key(
                self.keys
                    .task_current_concurrency_key(&env, &message.task_identifier),
            )
            .key(self.keys.message_key(message.run_id))
            .key(self.message_owner_key(message.run_id))
            .key(&message.master_queue)
            .arg(message.run_id.to_string())
            .arg(self.inflight_prefix())
            .arg(mode)
            .arg(nack_score)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl RunQueue for RedisRunQueue {
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
        let body = serialize_value(&message)?;
        let score = ms(message.available_at);

        let mut conn = self.get_connection().await?;
        let _: String = redis::Script::new(ENQUEUE_SCRIPT)
            .key(self.keys.message_key(message.run_id))
            .key(&queue_key)
            .key(master_queue)
            .arg(body)
            .arg(score)
            .arg(message.run_id.to_string())
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        debug!(run_id = %message.run_id, queue = %queue_key, master_queue, "enqueued message");
        Ok(())
    }

    async fn dequeue_message_in_shared_queue(
        &self,
        consumer_id: &str,
        master_queue: &str,
    ) -> Result<Option<RunMessage>> {
        let now_ms = ms(Utc::now());
        let mut conn = self.get_connection().await?;

        // Snapshot of candidate member queues, oldest head first.
        let candidates: Vec<String> = conn
            .zrangebyscore_limit(master_queue, 0, now_ms, 0, self.config.master_scan_limit as isize)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        if candidates.is_empty() {
            return Ok(None);
        }

        // Group queues by environment, dropping environments at their cap.
        let mut by_env: HashMap<String, (RunEnvironment, Vec<String>)> = HashMap::new();
        let mut env_order: Vec<String> = Vec::new();
        for queue_key in &candidates {
            let descriptor = match self.keys.parse_queue_key(queue_key) {
                Ok(d) => d,
                Err(e) => {
                    warn!(queue_key, "skipping malformed master-queue member: {e}");
                    continue;
                }
            };
            let env = descriptor.environment();
            let env_prefix = self.keys.env_prefix(&env);
            if !by_env.contains_key(&env_prefix) {
                let current: usize = conn
                    .scard(self.keys.env_current_concurrency_key(&env))
                    .await
                    .map_err(|e| QueueError::Connection(e.to_string()))?;
                let limit: Option<u32> = conn
                    .get(self.keys.env_concurrency_limit_key(&env))
                    .await
                    .map_err(|e| QueueError::Connection(e.to_string()))?;
                let limit = limit.unwrap_or(self.config.default_env_concurrency_limit);
                if current as u32 >= limit {
                    continue;
                }
                env_order.push(env_prefix.clone());
                by_env.insert(env_prefix.clone(), (env, Vec::new()));
            }
            if let Some((_, queues)) = by_env.get_mut(&env_prefix) {
                queues.push(queue_key.clone());
            }
        }

        while !env_order.is_empty() {
            let Some(env_prefix) = self.env_strategy.choose(&env_order) else {
                break;
            };
            let Some((env, mut queues)) = by_env.remove(&env_prefix) else {
                break;
            };
            env_order.retain(|e| *e != env_prefix);

            while !queues.is_empty() {
                let Some(queue_key) = self.queue_strategy.choose(&queues) else {
                    break;
                };
                let descriptor = self.keys.parse_queue_key(&queue_key)?;
                let named_queue = self.keys.queue_key(&env, &descriptor.queue, None);
                let has_ck = descriptor.concurrency_key.is_some();
                let ck_queue = descriptor
                    .concurrency_key
                    .as_deref()
                    .map(|ck| self.keys.queue_key(&env, &descriptor.queue, Some(ck)))
                    .unwrap_or_else(|| named_queue.clone());

                let body: Option<String> = redis::Script::new(CLAIM_SCRIPT)
                    .key(&queue_key)
                    .key(self.keys.env_current_concurrency_key(&env))
                    .key(self.keys.env_concurrency_limit_key(&env))
                    .key(self.keys.queue_current_concurrency_key(&named_queue))
                    .key(self.keys.queue_concurrency_limit_key(&named_queue))
                    .key(self.keys.queue_current_concurrency_key(&ck_queue))
                    .key(self.keys.queue_concurrency_limit_key(&ck_queue))
                    .key(master_queue)
                    .key(self.keys.inflight_key(consumer_id))
                    .arg(now_ms)
                    .arg(self.config.default_env_concurrency_limit)
                    .arg(format!("{}message:", self.keys.prefix()))
                    .arg(consumer_id)
                    .arg(if has_ck { "1" } else { "0" })
                    .arg(self.task_key_prefix(&env))
                    .invoke_async(&mut *conn)
                    .await
                    .map_err(|e| QueueError::Connection(e.to_string()))?;

                if let Some(body) = body {
                    let message: RunMessage = deserialize_value(&body)?;
                    debug!(
                        run_id = %message.run_id,
                        queue = %queue_key,
                        consumer_id,
                        "dequeued message"
                    );
                    return Ok(Some(message));
                }
                queues.retain(|q| *q != queue_key);
            }
        }

        Ok(None)
    }

    async fn acknowledge_message(&self, run_id: Uuid) -> Result<()> {
        match self.read_message(run_id).await? {
            Some(message) => self.settle(&message, "ack", 0).await,
            None => Ok(()),
        }
    }

    async fn nack_message(&self, run_id: Uuid, retry_at: Option<DateTime<Utc>>) -> Result<()> {
        match self.read_message(run_id).await? {
            Some(message) => {
                let score = ms(retry_at.unwrap_or_else(Utc::now));
                self.settle(&message, "nack", score).await
            }
            None => Ok(()),
        }
    }

    async fn release_concurrency(&self, run_id: Uuid) -> Result<()> {
        match self.read_message(run_id).await? {
            Some(message) => self.settle(&message, "release", 0).await,
            None => Ok(()),
        }
    }

    async fn reacquire_concurrency(&self, run_id: Uuid) -> Result<bool> {
        let Some(message) = self.read_message(run_id).await? else {
            return Err(QueueError::MessageNotFound(run_id));
        };
        let env = message.environment();
        let named_queue = self.keys.queue_key(&env, &message.queue_name, None);
        let has_ck = message.concurrency_key.is_some();
        let ck_queue = message
            .concurrency_key
            .as_deref()
            .map(|ck| self.keys.queue_key(&env, &message.queue_name, Some(ck)))
            .unwrap_or_else(|| named_queue.clone());

        let mut conn = self.get_connection().await?;
        let reacquired: i32 = redis::Script::new(REACQUIRE_SCRIPT)
            .key(self.keys.env_current_concurrency_key(&env))
            .key(self.keys.env_concurrency_limit_key(&env))
            .key(self.keys.queue_current_concurrency_key(&named_queue))
            .key(self.keys.queue_concurrency_limit_key(&named_queue))
            .key(self.keys.queue_current_concurrency_key(&ck_queue))
            .key(self.keys.queue_concurrency_limit_key(&ck_queue))
            .key(
                self.keys
                    .task_current_concurrency_key(&env, &message.task_identifier),
            )
            .key(
                self.keys
                    .task_concurrency_limit_key(&env, &message.task_identifier),
            )
            .arg(run_id.to_string())
            .arg(self.config.default_env_concurrency_limit)
            .arg(if has_ck { "1" } else { "0" })
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(reacquired == 1)
    }

    async fn update_queue_concurrency_limits(
        &self,
        env: &RunEnvironment,
        queue: &str,
        limit: u32,
    ) -> Result<()> {
        let queue_key = self.keys.queue_key(env, queue, None);
        let mut conn = self.get_connection().await?;
        let _: () = conn
            .set(self.keys.queue_concurrency_limit_key(&queue_key), limit)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn remove_queue_concurrency_limits(
        &self,
        env: &RunEnvironment,
        queue: &str,
    ) -> Result<()> {
        let queue_key = self.keys.queue_key(env, queue, None);
        let mut conn = self.get_connection().await?;
        let _: () = conn
            .del(self.keys.queue_concurrency_limit_key(&queue_key))
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn update_env_concurrency_limits(&self, env: &RunEnvironment, limit: u32) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = conn
            .set(self.keys.env_concurrency_limit_key(env), limit)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn read_message(&self, run_id: Uuid) -> Result<Option<RunMessage>> {
        let mut conn = self.get_connection().await?;
        let body: Option<String> = conn
            .get(self.keys.message_key(run_id))
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        match body {
            Some(body) => Ok(Some(deserialize_value(&body)?)),
            None => Ok(None),
        }
    }

    async fn queue_length(
        &self,
        env: &RunEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> Result<usize> {
        let queue_key = self.keys.queue_key(env, queue, concurrency_key);
        let mut conn = self.get_connection().await?;
        conn.zcard(&queue_key)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    async fn current_concurrency(
        &self,
        env: &RunEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> Result<usize> {
        let queue_key = self.keys.queue_key(env, queue, concurrency_key);
        let mut conn = self.get_connection().await?;
        conn.scard(self.keys.queue_current_concurrency_key(&queue_key))
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }
}
