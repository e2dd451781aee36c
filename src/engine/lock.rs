//! Distributed per-run locks.
//!
//! Every mutating engine operation takes the run's lock before touching
//! snapshot/waitpoint/queue state, so no two engine processes interleave
//! state-machine steps for the same run. Locks are leases: a holder that
//! dies frees the run after the lease elapses, and release/extend verify
//! the fencing token so a late holder cannot free someone else's lock.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// The lock stayed held by another process through every retry.
    #[error("run lock held: run={0}")]
    Held(Uuid),

    /// The lease expired (or was taken over) before release/extend.
    #[error("run lock lost: run={0}")]
    Lost(Uuid),

    /// A connection error from the backing store.
    #[error("connection error: {0}")]
    Connection(String),
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Lease parameters for run locks.
#[derive(Debug, Clone)]
pub struct RunLockConfig {
    /// How long one acquisition holds the run.
    pub lease: Duration,
    /// Extend when the remaining lease drops below this.
    pub extension_threshold: Duration,
    /// Acquisition attempts before giving up with [`LockError::Held`].
    pub max_retries: u32,
    /// Base sleep between acquisition attempts (jittered ±50%).
    pub retry_delay: Duration,
}

impl Default for RunLockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(5),
            extension_threshold: Duration::from_millis(500),
            max_retries: 10,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// A held lease on one run.
#[derive(Debug)]
pub struct RunLock {
    pub run_id: Uuid,
    token: Uuid,
    expires_at: DateTime<Utc>,
}

impl RunLock {
    /// True when the remaining lease is below the extension threshold.
    pub fn needs_extension(&self, threshold: Duration) -> bool {
        let remaining = self.expires_at - Utc::now();
        remaining < ChronoDuration::milliseconds(threshold.as_millis() as i64)
    }
}

/// Lock manager interface; Redis in production, in-memory for tests.
#[async_trait]
pub trait RunLockManager: Send + Sync {
    async fn acquire(&self, run_id: Uuid) -> Result<RunLock>;

    /// Renews the lease for another full period.
    async fn extend(&self, lock: &mut RunLock) -> Result<()>;

    async fn release(&self, lock: RunLock) -> Result<()>;
}

fn jittered(delay: Duration) -> Duration {
    let base = delay.as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0..=base);
    Duration::from_millis(base / 2 + jitter)
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Process-local lock manager with the same lease semantics as Redis.
pub struct InMemoryRunLockManager {
    config: RunLockConfig,
    locks: DashMap<Uuid, (Uuid, DateTime<Utc>)>,
}

impl Default for InMemoryRunLockManager {
    fn default() -> Self {
        Self::new(RunLockConfig::default())
    }
}

impl InMemoryRunLockManager {
    pub fn new(config: RunLockConfig) -> Self {
        Self {
            config,
            locks: DashMap::new(),
        }
    }

    fn try_take(&self, run_id: Uuid, token: Uuid, expires_at: DateTime<Utc>) -> bool {
        let now = Utc::now();
        let mut entry = self.locks.entry(run_id).or_insert((token, expires_at));
        if entry.0 == token {
            return true;
        }
        if entry.1 <= now {
            *entry = (token, expires_at);
            return true;
        }
        false
    }
}

#[async_trait]
impl RunLockManager for InMemoryRunLockManager {
    async fn acquire(&self, run_id: Uuid) -> Result<RunLock> {
        let token = Uuid::new_v4();
        for attempt in 0..=self.config.max_retries {
            let expires_at =
                Utc::now() + ChronoDuration::milliseconds(self.config.lease.as_millis() as i64);
            if self.try_take(run_id, token, expires_at) {
                debug!(%run_id, attempt, "acquired run lock");
                return Ok(RunLock {
                    run_id,
                    token,
                    expires_at,
                });
            }
            tokio::time::sleep(jittered(self.config.retry_delay)).await;
        }
        Err(LockError::Held(run_id))
    }

    async fn extend(&self, lock: &mut RunLock) -> Result<()> {
        let expires_at =
            Utc::now() + ChronoDuration::milliseconds(self.config.lease.as_millis() as i64);
        let mut entry = self
            .locks
            .get_mut(&lock.run_id)
            .ok_or(LockError::Lost(lock.run_id))?;
        if entry.0 != lock.token {
            return Err(LockError::Lost(lock.run_id));
        }
        entry.1 = expires_at;
        lock.expires_at = expires_at;
        Ok(())
    }

    async fn release(&self, lock: RunLock) -> Result<()> {
        // Compare-and-delete: only the token holder may free the run.
        self.locks
            .remove_if(&lock.run_id, |_, (token, _)| *token == lock.token);
        Ok(())
    }
}

// ============================================================================
// Redis implementation
// ============================================================================

#[cfg(feature = "redis")]
mod redis_lock {
    use super::*;
    use deadpool_redis::{Config, Pool, Runtime};

    /// Compare-and-delete release.
    const RELEASE_SCRIPT: &str = r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
    "#;

    /// Compare-and-pexpire extension.
    const EXTEND_SCRIPT: &str = r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('PEXPIRE', KEYS[1], ARGV[2])
        end
        return 0
    "#;

    /// Redis lock manager: `SET key token NX PX lease`.
    pub struct RedisRunLockManager {
        pool: Pool,
        prefix: String,
        config: RunLockConfig,
    }

    impl RedisRunLockManager {
        pub async fn new(
            redis_url: &str,
            prefix: impl Into<String>,
            config: RunLockConfig,
        ) -> Result<Self> {
            let cfg = Config::from_url(redis_url);
            let pool = cfg
                .create_pool(Some(Runtime::Tokio1))
                .map_err(|e| LockError::Connection(e.to_string()))?;
            let mut prefix = prefix.into();
            if !prefix.is_empty() && !prefix.ends_with(':') {
                prefix.push(':');
            }
            Ok(Self {
                pool,
                prefix,
                config,
            })
        }

        fn lock_key(&self, run_id: Uuid) -> String {
            format!("{}lock:run:{}", self.prefix, run_id)
        }

        async fn get_connection(&self) -> Result<deadpool_redis::Connection> {
            self.pool
                .get()
                .await
                .map_err(|e| LockError::Connection(e.to_string()))
        }
    }

    #[async_trait]
    impl RunLockManager for RedisRunLockManager {
        async fn acquire(&self, run_id: Uuid) -> Result<RunLock> {
            let token = Uuid::new_v4();
            let lease_ms = self.config.lease.as_millis() as u64;
            let key = self.lock_key(run_id);

            for attempt in 0..=self.config.max_retries {
                let mut conn = self.get_connection().await?;
                let taken: Option<String> = redis::cmd("SET")
                    .arg(&key)
                    .arg(token.to_string())
                    .arg("NX")
                    .arg("PX")
                    .arg(lease_ms)
                    .query_async(&mut *conn)
                    .await
                    .map_err(|e| LockError::Connection(e.to_string()))?;
                if taken.is_some() {
                    debug!(%run_id, attempt, "acquired run lock");
                    return Ok(RunLock {
                        run_id,
                        token,
                        expires_at: Utc::now()
                            + ChronoDuration::milliseconds(lease_ms as i64),
                    });
                }
                tokio::time::sleep(jittered(self.config.retry_delay)).await;
            }
            Err(LockError::Held(run_id))
        }

        async fn extend(&self, lock: &mut RunLock) -> Result<()> {
            let lease_ms = self.config.lease.as_millis() as u64;
            let mut conn = self.get_connection().await?;
            let extended: i32 = redis::Script::new(EXTEND_SCRIPT)
                .key(self.lock_key(lock.run_id))
                .arg(lock.token.to_string())
                .arg(lease_ms)
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| LockError::Connection(e.to_string()))?;
            if extended == 0 {
                return Err(LockError::Lost(lock.run_id));
            }
            lock.expires_at = Utc::now() + ChronoDuration::milliseconds(lease_ms as i64);
            Ok(())
        }

        async fn release(&self, lock: RunLock) -> Result<()> {
            let mut conn = self.get_connection().await?;
            let _: i32 = redis::Script::new(RELEASE_SCRIPT)
                .key(self.lock_key(lock.run_id))
                .arg(lock.token.to_string())
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| LockError::Connection(e.to_string()))?;
            Ok(())
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_lock::RedisRunLockManager;
