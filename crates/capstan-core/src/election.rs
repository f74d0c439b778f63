//! Lease-based leader election over the coordination KV.
//!
//! The WAL write path and the background loops (checkpointer, GC,
//! scheduler) only run on the current leader. Leadership is a
//! time-bounded lease, not a lock: the leader must renew periodically
//! or lose it, and losing it must abort in-flight writes.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::kv::{Compare, KvStore, LeaseId, TxnOp, TxnRequest};

/// Result of a leadership acquisition attempt.
#[derive(Debug)]
pub enum Campaign {
    /// Leadership acquired; hold the lease via [`LeaderLease`].
    Acquired(LeaderLease),
    /// Leadership is held by another instance.
    NotLeader {
        /// Identifier of the current leader, if known.
        current_leader: Option<String>,
    },
}

impl Campaign {
    /// Returns true if leadership was acquired.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Lease-based leader election for a single election key.
#[derive(Clone)]
pub struct LeaderElection {
    kv: Arc<dyn KvStore>,
    key: String,
    instance_id: String,
    ttl: Duration,
}

impl LeaderElection {
    /// Creates an election on `key` for this instance.
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        key: impl Into<String>,
        instance_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            kv,
            key: key.into(),
            instance_id: instance_id.into(),
            ttl,
        }
    }

    /// Attempts to acquire leadership once.
    ///
    /// The election key is written under a lease; if the holder stops
    /// renewing, the key expires and another instance can win.
    ///
    /// # Errors
    ///
    /// Returns an error if the KV store is unreachable.
    pub async fn try_acquire(&self) -> Result<Campaign> {
        let lease = self.kv.lease_grant(self.ttl).await?;

        // Claim the key only if nobody holds it. The lease keeps the
        // claim alive; crashing without releasing frees it after TTL.
        let claimed = self
            .kv
            .txn(TxnRequest {
                compares: vec![Compare {
                    key: self.key.clone(),
                    revision: 0,
                }],
                ops: vec![TxnOp::Put {
                    key: self.key.clone(),
                    value: Bytes::from(self.instance_id.clone()),
                    lease: Some(lease),
                }],
            })
            .await?;

        if claimed.succeeded {
            tracing::info!(key = %self.key, instance = %self.instance_id, "acquired leadership");
            return Ok(Campaign::Acquired(LeaderLease {
                kv: self.kv.clone(),
                key: self.key.clone(),
                instance_id: self.instance_id.clone(),
                lease,
            }));
        }

        self.kv.lease_revoke(lease).await?;
        let current = self.kv.get(&self.key).await?;
        Ok(Campaign::NotLeader {
            current_leader: current
                .map(|entry| String::from_utf8_lossy(&entry.value).into_owned()),
        })
    }

    /// Returns the current leader's instance id, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the KV store is unreachable.
    pub async fn current_leader(&self) -> Result<Option<String>> {
        Ok(self
            .kv
            .get(&self.key)
            .await?
            .map(|entry| String::from_utf8_lossy(&entry.value).into_owned()))
    }
}

/// A held leadership lease.
pub struct LeaderLease {
    kv: Arc<dyn KvStore>,
    key: String,
    instance_id: String,
    lease: LeaseId,
}

impl std::fmt::Debug for LeaderLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderLease")
            .field("key", &self.key)
            .field("instance_id", &self.instance_id)
            .field("lease", &self.lease)
            .finish()
    }
}

impl LeaderLease {
    /// Returns the instance id holding the lease.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Renews the lease.
    ///
    /// Returns false when leadership was lost: the lease expired and
    /// another instance may already hold the key. The caller must stop
    /// acting as leader immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the KV store is unreachable.
    pub async fn renew(&self) -> Result<bool> {
        if self.kv.lease_keepalive(self.lease).await.is_err() {
            tracing::warn!(key = %self.key, instance = %self.instance_id, "leadership lost");
            return Ok(false);
        }
        // The key must still be ours: a keepalive that revived a lease
        // after its keys expired would otherwise fake leadership.
        let holder = self.kv.get(&self.key).await?;
        Ok(holder.is_some_and(|entry| entry.value == Bytes::from(self.instance_id.clone())))
    }

    /// Voluntarily releases leadership for orderly shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the KV store is unreachable.
    pub async fn resign(self) -> Result<()> {
        self.kv.lease_revoke(self.lease).await
    }
}
