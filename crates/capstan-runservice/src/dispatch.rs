//! Executor registry and dispatch selection.
//!
//! Executors register ephemerally in the coordination KV: their
//! registration is attached to a lease renewed by heartbeats, so a
//! crashed executor disappears on its own. Selection picks the least
//! loaded live executor whose labels cover the task's requirements.

use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use capstan_core::kv::{KvStore, LeaseId};
use capstan_core::{paths, Error, ExecutorId, Result};
use capstan_datamanager::executor_group;

use crate::types::Executor;

/// Executor registry over ephemeral KV registrations.
#[derive(Clone)]
pub struct ExecutorRegistry {
    kv: Arc<dyn KvStore>,
    heartbeat_interval: Duration,
}

/// A live registration, held by the executor process.
///
/// Dropping the handle without deregistering leaves the lease to
/// expire, which removes the registration after the TTL.
pub struct ExecutorHandle {
    executor_id: ExecutorId,
    lease: LeaseId,
}

impl ExecutorHandle {
    /// The registered executor's id.
    #[must_use]
    pub const fn executor_id(&self) -> ExecutorId {
        self.executor_id
    }
}

impl ExecutorRegistry {
    /// Creates a registry with the configured heartbeat interval.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, heartbeat_interval: Duration) -> Self {
        Self {
            kv,
            heartbeat_interval,
        }
    }

    /// Registers an executor, binding its registration to a lease of
    /// two heartbeat intervals.
    ///
    /// # Errors
    ///
    /// Returns an error if the KV store is unreachable.
    pub async fn register(&self, executor: &Executor) -> Result<ExecutorHandle> {
        let lease = self.kv.lease_grant(self.heartbeat_interval * 2).await?;
        self.kv
            .put_with_lease(
                &paths::executor_key(&executor.id.to_string()),
                Bytes::from(serde_json::to_vec(executor)?),
                lease,
            )
            .await?;
        tracing::info!(executor = %executor.id, "executor registered");
        Ok(ExecutorHandle {
            executor_id: executor.id,
            lease,
        })
    }

    /// Records a heartbeat: refreshes the lease, updates the reported
    /// capacity and bumps the executor's changegroup so in-flight
    /// dispatch decisions based on the old capacity conflict.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the lease already expired; the executor
    /// must re-register.
    pub async fn heartbeat(&self, handle: &ExecutorHandle, active_tasks: u32) -> Result<()> {
        self.kv.lease_keepalive(handle.lease).await?;

        let key = paths::executor_key(&handle.executor_id.to_string());
        let entry = self
            .kv
            .get(&key)
            .await?
            .ok_or_else(|| Error::not_found("executor", handle.executor_id))?;
        let mut executor: Executor = serde_json::from_slice(&entry.value)?;
        executor.active_tasks = active_tasks;
        executor.last_heartbeat = Utc::now();
        self.kv
            .put_with_lease(&key, Bytes::from(serde_json::to_vec(&executor)?), handle.lease)
            .await?;
        self.kv
            .put(
                &capstan_core::paths::change_group_key(&executor_group(
                    &handle.executor_id.to_string(),
                )),
                Bytes::from("heartbeat"),
            )
            .await?;
        Ok(())
    }

    /// Deregisters an executor, removing its registration immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the KV store is unreachable.
    pub async fn deregister(&self, handle: ExecutorHandle) -> Result<()> {
        self.kv.lease_revoke(handle.lease).await?;
        tracing::info!(executor = %handle.executor_id, "executor deregistered");
        Ok(())
    }

    /// Lists the currently registered executors.
    ///
    /// # Errors
    ///
    /// Returns an error if the KV store is unreachable.
    pub async fn list(&self) -> Result<Vec<Executor>> {
        let mut executors = Vec::new();
        for entry in self.kv.list(paths::EXECUTOR_PREFIX).await? {
            executors.push(serde_json::from_slice(&entry.value)?);
        }
        Ok(executors)
    }

    /// Staleness cutoff for selection: two heartbeat intervals.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

/// Picks the executor for a task.
///
/// Filters executors whose labels cover `required_labels`, with free
/// capacity and a heartbeat fresher than `stale_after`. Among those,
/// the smallest `active_tasks / active_tasks_limit` ratio wins;
/// ties break on lexicographic id.
#[must_use]
pub fn select_executor<'a>(
    executors: &'a [Executor],
    required_labels: &HashMap<String, String>,
    stale_after: Duration,
) -> Option<&'a Executor> {
    let now = Utc::now();
    let stale =
        chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::seconds(10));

    executors
        .iter()
        .filter(|executor| {
            required_labels
                .iter()
                .all(|(k, v)| executor.labels.get(k) == Some(v))
                && executor.active_tasks < executor.active_tasks_limit
                && now - executor.last_heartbeat < stale
        })
        .min_by(|a, b| {
            // Compare a.active/a.limit vs b.active/b.limit without
            // floats: cross-multiply.
            let left = u64::from(a.active_tasks) * u64::from(b.active_tasks_limit);
            let right = u64::from(b.active_tasks) * u64::from(a.active_tasks_limit);
            left.cmp(&right).then_with(|| a.id.cmp(&b.id))
        })
}
