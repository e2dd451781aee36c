//! Redis delayed-job queue.
//!
//! # Data Structures
//!
//! - `{p}jobs:pending` (ZSET): job ids scored by availability timestamp
//! - `{p}jobs:claimed` (ZSET): job ids scored by claim expiry
//! - `{p}job:{id}` (STRING): job body JSON

use super::{
    ClaimedJob, DelayedJob, DelayedJobError, DelayedJobQueue, Result, DEFAULT_VISIBILITY_TIMEOUT,
};
use crate::core::{deserialize_value, serialize_value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::warn;

/// Atomically reclaim expired claims, then move up to `limit` ready jobs
/// into the claimed set and return their bodies.
///
/// KEYS: [1] pending zset, [2] claimed zset
/// ARGV: [1] now_ms, [2] claim expiry ms, [3] limit, [4] body key prefix
const CLAIM_SCRIPT: &str = r#"
    local expired = redis.call('ZRANGEBYSCORE', KEYS[2], 0, ARGV[1])
    for _, job_id in ipairs(expired) do
        redis.call('ZREM', KEYS[2], job_id)
        redis.call('ZADD', KEYS[1], ARGV[1], job_id)
    end

    local ready = redis.call('ZRANGEBYSCORE', KEYS[1], 0, ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
    local claimed = {}
    for _, job_id in ipairs(ready) do
        local body = redis.call('GET', ARGV[4] .. job_id)
        redis.call('ZREM', KEYS[1], job_id)
        if body then
            redis.call('ZADD', KEYS[2], ARGV[2], job_id)
            table.insert(claimed, job_id)
            table.insert(claimed, body)
        end
    end
    return claimed
"#;

/// Redis [`DelayedJobQueue`] using async connection pooling.
pub struct RedisDelayedJobQueue {
    pool: Pool,
    prefix: String,
    visibility_timeout: Duration,
}

impl RedisDelayedJobQueue {
    pub async fn new(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| DelayedJobError::Connection(e.to_string()))?;

        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with(':') {
            prefix.push(':');
        }
        Ok(Self {
            pool,
            prefix,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        })
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| DelayedJobError::Connection(e.to_string()))
    }

    fn pending_key(&self) -> String {
        format!("{}jobs:pending", self.prefix)
    }

    fn claimed_key(&self) -> String {
        format!("{}jobs:claimed", self.prefix)
    }

    fn body_prefix(&self) -> String {
        format!("{}job:", self.prefix)
    }
}

#[async_trait]
impl DelayedJobQueue for RedisDelayedJobQueue {
    async fn enqueue(&self, job: DelayedJob, available_at: DateTime<Utc>) -> Result<()> {
        let job_id = job.job_id();
        let body = serialize_value(&job)?;
        let mut conn = self.get_connection().await?;
        // ZADD on an existing member just moves its score, which is exactly
        // the duplicate-collapse the deterministic ids are for.
        let _: () = redis::pipe()
            .atomic()
            .set(format!("{}{}", self.body_prefix(), job_id), body)
            .zrem(self.claimed_key(), &job_id)
            .zadd(self.pending_key(), &job_id, available_at.timestamp_millis())
            .query_async(&mut *conn)
            .await
            .map_err(|e| DelayedJobError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.pending_key(), job_id)
            .del(format!("{}{}", self.body_prefix(), job_id))
            .query_async(&mut *conn)
            .await
            .map_err(|e| DelayedJobError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn claim_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ClaimedJob>> {
        let now_ms = now.timestamp_millis();
        let expiry_ms = now_ms + self.visibility_timeout.as_millis() as i64;
        let mut conn = self.get_connection().await?;

        let raw: Vec<String> = redis::Script::new(CLAIM_SCRIPT)
            .key(self.pending_key())
            .key(self.claimed_key())
            .arg(now_ms)
            .arg(expiry_ms)
            .arg(limit)
            .arg(self.body_prefix())
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| DelayedJobError::Connection(e.to_string()))?;

        let mut claims = Vec::with_capacity(raw.len() / 2);
        for pair in raw.chunks_exact(2) {
            match deserialize_value::<DelayedJob>(&pair[1]) {
                Ok(job) => claims.push(ClaimedJob {
                    job,
                    job_id: pair[0].clone(),
                }),
                Err(e) => {
                    warn!(job_id = %pair[0], "dropping undecodable delayed job: {e}");
                    let _: () = conn
                        .zrem(self.claimed_key(), &pair[0])
                        .await
                        .map_err(|e| DelayedJobError::Connection(e.to_string()))?;
                }
            }
        }
        Ok(claims)
    }

    async fn ack(&self, job_id: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.claimed_key(), job_id)
            .del(format!("{}{}", self.body_prefix(), job_id))
            .query_async(&mut *conn)
            .await
            .map_err(|e| DelayedJobError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn nack(&self, job_id: &str, retry_at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.claimed_key(), job_id)
            .zadd(self.pending_key(), job_id, retry_at.timestamp_millis())
            .query_async(&mut *conn)
            .await
            .map_err(|e| DelayedJobError::Connection(e.to_string()))?;
        Ok(())
    }
}
