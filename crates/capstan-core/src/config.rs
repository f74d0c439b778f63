//! Engine configuration.
//!
//! Deserialized from JSON; every duration is expressed in seconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Object storage backend selector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStorageType {
    /// Local filesystem storage.
    #[default]
    Posix,
    /// S3-compatible object storage.
    S3,
}

/// Object storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObjectStorageConfig {
    /// Backend type.
    #[serde(rename = "type", default)]
    pub storage_type: ObjectStorageType,
    /// Root directory (posix).
    #[serde(default)]
    pub path: Option<String>,
    /// Endpoint URL (s3).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Bucket name (s3).
    #[serde(default)]
    pub bucket: Option<String>,
    /// Region (s3).
    #[serde(default)]
    pub region: Option<String>,
    /// Access key (s3).
    #[serde(default)]
    pub access_key: Option<String>,
    /// Secret access key (s3).
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

impl std::fmt::Display for ObjectStorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Posix => write!(f, "posix"),
            Self::S3 => write!(f, "s3"),
        }
    }
}

/// Coordination service configuration.
///
/// Endpoints and TLS material for a networked `KvStore` backend; the
/// in-process store ignores them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EtcdConfig {
    /// Endpoint URLs.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Path to the client TLS certificate.
    #[serde(default)]
    pub tls_cert_file: Option<String>,
    /// Path to the client TLS key.
    #[serde(default)]
    pub tls_key_file: Option<String>,
    /// Path to the CA certificate bundle.
    #[serde(default)]
    pub tls_ca_file: Option<String>,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Object storage backend.
    #[serde(default)]
    pub object_storage: ObjectStorageConfig,

    /// Coordination service.
    #[serde(default)]
    pub etcd: EtcdConfig,

    /// Seconds after which terminal runs (and their logs/artifacts)
    /// are garbage collected.
    #[serde(default = "default_run_cache_expire_interval")]
    pub run_cache_expire_interval: u64,

    /// Default per-executor concurrent task cap, used when an executor
    /// registers without one.
    #[serde(default = "default_active_tasks_limit")]
    pub active_tasks_limit: u32,

    /// Location of the helper binary executors inject into containers.
    /// Opaque to the engine.
    #[serde(default = "default_toolbox_path")]
    pub toolbox_path: String,

    /// Seconds between scheduler ticks.
    #[serde(default = "default_sched_interval")]
    pub scheduler_interval: u64,

    /// Seconds between checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// Seconds between executor heartbeats. Executors missing two
    /// intervals are excluded from dispatch.
    #[serde(default = "default_heartbeat_interval")]
    pub executor_heartbeat_interval: u64,

    /// Leader lease TTL in seconds.
    #[serde(default = "default_lease_ttl")]
    pub leader_lease_ttl: u64,
}

fn default_run_cache_expire_interval() -> u64 {
    7 * 24 * 3600
}

fn default_active_tasks_limit() -> u32 {
    2
}

fn default_toolbox_path() -> String {
    "/usr/local/bin/capstan-toolbox".to_string()
}

fn default_sched_interval() -> u64 {
    2
}

fn default_checkpoint_interval() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_lease_ttl() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            object_storage: ObjectStorageConfig::default(),
            etcd: EtcdConfig::default(),
            run_cache_expire_interval: default_run_cache_expire_interval(),
            active_tasks_limit: default_active_tasks_limit(),
            toolbox_path: default_toolbox_path(),
            scheduler_interval: default_sched_interval(),
            checkpoint_interval: default_checkpoint_interval(),
            executor_heartbeat_interval: default_heartbeat_interval(),
            leader_lease_ttl: default_lease_ttl(),
        }
    }
}

impl Config {
    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` on malformed input or failed validation.
    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)
            .map_err(|e| Error::bad_request(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` when a field combination is unusable.
    pub fn validate(&self) -> Result<()> {
        match self.object_storage.storage_type {
            ObjectStorageType::Posix => {
                if self.object_storage.path.is_none() {
                    return Err(Error::bad_request("object_storage.path required for posix"));
                }
            }
            ObjectStorageType::S3 => {
                if self.object_storage.bucket.is_none() {
                    return Err(Error::bad_request("object_storage.bucket required for s3"));
                }
            }
        }
        if self.active_tasks_limit == 0 {
            return Err(Error::bad_request("active_tasks_limit must be positive"));
        }
        if self.leader_lease_ttl == 0 {
            return Err(Error::bad_request("leader_lease_ttl must be positive"));
        }
        Ok(())
    }

    /// Executor staleness cutoff: two missed heartbeats.
    #[must_use]
    pub const fn executor_stale_after(&self) -> Duration {
        Duration::from_secs(self.executor_heartbeat_interval * 2)
    }

    /// Terminal run retention as a duration.
    #[must_use]
    pub const fn run_cache_expire(&self) -> Duration {
        Duration::from_secs(self.run_cache_expire_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_posix_config_parses() {
        let config = Config::from_json(
            r#"{
                "object_storage": { "type": "posix", "path": "/tmp/capstan" },
                "etcd": { "endpoints": ["http://127.0.0.1:2379"] }
            }"#,
        )
        .expect("parse");

        assert_eq!(config.object_storage.storage_type, ObjectStorageType::Posix);
        assert_eq!(config.active_tasks_limit, 2);
        assert_eq!(config.executor_stale_after(), Duration::from_secs(10));
    }

    #[test]
    fn s3_without_bucket_is_rejected() {
        let err = Config::from_json(r#"{ "object_storage": { "type": "s3" } }"#).unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[test]
    fn zero_active_tasks_limit_is_rejected() {
        let err = Config::from_json(
            r#"{
                "object_storage": { "type": "posix", "path": "/tmp/x" },
                "active_tasks_limit": 0
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }
}
