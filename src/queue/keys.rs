//! Canonical key naming for every queue and concurrency construct.
//!
//! All tenant coordinates are embedded into the key path, so:
//! - one `SCAN` pattern recovers all queues for a tenant, and
//! - given any queue key, the env-level and task-level counter keys derive
//!   by parsing the key alone, with no state reads.
//!
//! Key segments (org/project/env ids, queue names, concurrency keys) must
//! not contain `:`.

use crate::core::{EnvironmentType, RunEnvironment};
use crate::core::{Error, Result};
use std::str::FromStr;
use uuid::Uuid;

const DEFAULT_PREFIX: &str = "drover:";

/// Builds the Redis key for each queue/concurrency construct.
#[derive(Debug, Clone)]
pub struct KeyProducer {
    prefix: String,
}

impl KeyProducer {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with(':') {
            prefix.push(':');
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{p}org:{o}:proj:{pr}:envType:{t}:env:{e}`
    pub fn env_prefix(&self, env: &RunEnvironment) -> String {
        format!(
            "{}org:{}:proj:{}:envType:{}:env:{}",
            self.prefix,
            env.organization_id,
            env.project_id,
            env.environment_type.as_str(),
            env.environment_id
        )
    }

    /// `{env_prefix}:queue:{q}[:ck:{k}]` → sorted set of run ids by score.
    pub fn queue_key(
        &self,
        env: &RunEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> String {
        match concurrency_key {
            Some(ck) => format!("{}:queue:{}:ck:{}", self.env_prefix(env), queue, ck),
            None => format!("{}:queue:{}", self.env_prefix(env), queue),
        }
    }

    /// `{queue_key}:concurrency` → scalar limit.
    pub fn queue_concurrency_limit_key(&self, queue_key: &str) -> String {
        format!("{queue_key}:concurrency")
    }

    /// `{queue_key}:currentConcurrency` → set of executing run ids.
    pub fn queue_current_concurrency_key(&self, queue_key: &str) -> String {
        format!("{queue_key}:currentConcurrency")
    }

    pub fn env_concurrency_limit_key(&self, env: &RunEnvironment) -> String {
        format!("{}:concurrency", self.env_prefix(env))
    }

    pub fn env_current_concurrency_key(&self, env: &RunEnvironment) -> String {
        format!("{}:currentConcurrency", self.env_prefix(env))
    }

    /// Per-task-identifier counter: `{env_prefix}:task:{id}:currentConcurrency`.
    pub fn task_current_concurrency_key(
        &self,
        env: &RunEnvironment,
        task_identifier: &str,
    ) -> String {
        format!("{}:task:{}:currentConcurrency", self.env_prefix(env), task_identifier)
    }

    /// Optional per-task-identifier limit: `{env_prefix}:task:{id}:concurrency`.
    pub fn task_concurrency_limit_key(
        &self,
        env: &RunEnvironment,
        task_identifier: &str,
    ) -> String {
        format!("{}:task:{}:concurrency", self.env_prefix(env), task_identifier)
    }

    /// The master queue a supervisor for this environment pulls from.
    ///
    /// DEVELOPMENT environments get their own isolated shared queue; all
    /// other environment types share one.
    pub fn shared_queue_key(&self, env: &RunEnvironment) -> String {
        if env.environment_type.is_development() {
            format!("{}:sharedQueue", self.env_prefix(env))
        } else {
            format!("{}sharedQueue", self.prefix)
        }
    }

    /// `{p}masterQueue:{name}` → sorted set of member queue keys.
    pub fn master_queue_key(&self, name: &str) -> String {
        format!("{}masterQueue:{}", self.prefix, name)
    }

    /// `{p}message:{run_id}` → message body JSON.
    pub fn message_key(&self, run_id: Uuid) -> String {
        format!("{}message:{}", self.prefix, run_id)
    }

    /// `{p}inflight:{consumer}` → set of run ids this consumer holds.
    pub fn inflight_key(&self, consumer_id: &str) -> String {
        format!("{}inflight:{}", self.prefix, consumer_id)
    }

    /// Recover a queue's tenant coordinates from its key.
    pub fn parse_queue_key(&self, queue_key: &str) -> Result<QueueDescriptor> {
        let stripped = queue_key
            .strip_prefix(&self.prefix)
            .ok_or_else(|| Error::InvalidQueueKey(queue_key.to_string()))?;

        let parts: Vec<&str> = stripped.split(':').collect();
        // org {o} proj {p} envType {t} env {e} queue {q} [ck {k}]
        if parts.len() != 10 && parts.len() != 12 {
            return Err(Error::InvalidQueueKey(queue_key.to_string()));
        }
        if parts[0] != "org" || parts[2] != "proj" || parts[4] != "envType" || parts[6] != "env"
            || parts[8] != "queue"
        {
            return Err(Error::InvalidQueueKey(queue_key.to_string()));
        }
        let concurrency_key = if parts.len() == 12 {
            if parts[10] != "ck" {
                return Err(Error::InvalidQueueKey(queue_key.to_string()));
            }
            Some(parts[11].to_string())
        } else {
            None
        };

        Ok(QueueDescriptor {
            organization_id: parts[1].to_string(),
            project_id: parts[3].to_string(),
            environment_type: EnvironmentType::from_str(parts[5])
                .map_err(|_| Error::InvalidQueueKey(queue_key.to_string()))?,
            environment_id: parts[7].to_string(),
            queue: parts[9].to_string(),
            concurrency_key,
        })
    }
}

impl Default for KeyProducer {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

/// Tenant coordinates recovered from a queue key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub organization_id: String,
    pub project_id: String,
    pub environment_type: EnvironmentType,
    pub environment_id: String,
    pub queue: String,
    pub concurrency_key: Option<String>,
}

impl QueueDescriptor {
    pub fn environment(&self) -> RunEnvironment {
        RunEnvironment {
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            environment_id: self.environment_id.clone(),
            environment_type: self.environment_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> RunEnvironment {
        RunEnvironment::new("org_1", "proj_1", "env_1", EnvironmentType::Production)
    }

    #[test]
    fn test_queue_key_layout() {
        let keys = KeyProducer::default();
        assert_eq!(
            keys.queue_key(&env(), "default", None),
            "drover:org:org_1:proj:proj_1:envType:PRODUCTION:env:env_1:queue:default"
        );
        assert_eq!(
            keys.queue_key(&env(), "default", Some("user-42")),
            "drover:org:org_1:proj:proj_1:envType:PRODUCTION:env:env_1:queue:default:ck:user-42"
        );
    }

    #[test]
    fn test_counter_keys_derive_from_queue_key() {
        let keys = KeyProducer::default();
        let qk = keys.queue_key(&env(), "default", None);
        assert_eq!(
            keys.queue_current_concurrency_key(&qk),
            format!("{qk}:currentConcurrency")
        );
        assert_eq!(keys.queue_concurrency_limit_key(&qk), format!("{qk}:concurrency"));
    }

    #[test]
    fn test_parse_roundtrip() {
        let keys = KeyProducer::default();
        let qk = keys.queue_key(&env(), "emails", Some("tenant-9"));
        let d = keys.parse_queue_key(&qk).unwrap();
        assert_eq!(d.organization_id, "org_1");
        assert_eq!(d.queue, "emails");
        assert_eq!(d.concurrency_key.as_deref(), Some("tenant-9"));
        assert_eq!(d.environment(), env());
        assert_eq!(keys.queue_key(&d.environment(), &d.queue, d.concurrency_key.as_deref()), qk);
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        let keys = KeyProducer::default();
        assert!(keys.parse_queue_key("drover:message:abc").is_err());
        assert!(keys.parse_queue_key("other:org:o:proj:p:envType:PRODUCTION:env:e:queue:q").is_err());
    }

    #[test]
    fn test_dev_shared_queue_is_isolated() {
        let keys = KeyProducer::default();
        let dev = RunEnvironment::new("org_1", "proj_1", "env_dev", EnvironmentType::Development);
        assert_eq!(keys.shared_queue_key(&env()), "drover:sharedQueue");
        assert!(keys.shared_queue_key(&dev).ends_with(":env:env_dev:sharedQueue"));
        assert_ne!(keys.shared_queue_key(&dev), keys.shared_queue_key(&env()));
    }
}
