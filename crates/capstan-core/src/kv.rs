//! Coordination KV abstraction: atomic CAS transactions, watches and
//! leases.
//!
//! The datamanager serializes every state-changing write through a
//! single multi-compare multi-op transaction against this store, and
//! the ReadDB tails it through a prefix watch. Executors keep their
//! registrations alive through leases; keys attached to an expired
//! lease disappear on their own.
//!
//! [`MemoryKv`] is the in-process implementation used for
//! single-process deployments and tests. A networked backend (e.g.
//! etcd, whose endpoints the configuration already carries) plugs in
//! behind the same [`KvStore`] trait.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A lease identifier. Keys attached to a lease are deleted when the
/// lease expires without a keepalive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(u64);

impl LeaseId {
    /// Returns the raw lease number.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A stored key-value pair with its revision metadata.
#[derive(Debug, Clone)]
pub struct KvEntry {
    /// The full key.
    pub key: String,
    /// The stored value.
    pub value: Bytes,
    /// Revision at which this key was last modified.
    pub mod_revision: u64,
    /// Lease the key is attached to, if any.
    pub lease: Option<LeaseId>,
}

/// A revision comparison inside a transaction.
///
/// `revision == 0` asserts that the key does not exist.
#[derive(Debug, Clone)]
pub struct Compare {
    /// Key whose mod revision is compared.
    pub key: String,
    /// Expected mod revision (0 = key must be absent).
    pub revision: u64,
}

/// A write operation inside a transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// Store a value under a key, optionally attached to a lease.
    Put {
        /// Destination key.
        key: String,
        /// Value to store.
        value: Bytes,
        /// Lease to attach the key to, if any.
        lease: Option<LeaseId>,
    },
    /// Remove a key. Deleting an absent key is a no-op.
    Delete {
        /// Key to remove.
        key: String,
    },
}

impl TxnOp {
    /// Convenience constructor for an unleased put.
    #[must_use]
    pub fn put(key: impl Into<String>, value: Bytes) -> Self {
        Self::Put {
            key: key.into(),
            value,
            lease: None,
        }
    }

    /// Convenience constructor for a delete.
    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// An atomic multi-compare multi-op transaction.
///
/// All compares must pass for the ops to apply; every op in a
/// successful transaction shares one new revision.
#[derive(Debug, Clone, Default)]
pub struct TxnRequest {
    /// Revision compares that gate the ops.
    pub compares: Vec<Compare>,
    /// Ops applied atomically when all compares pass.
    pub ops: Vec<TxnOp>,
}

/// Outcome of a transaction.
#[derive(Debug, Clone)]
pub struct TxnResult {
    /// True if all compares passed and the ops were applied.
    pub succeeded: bool,
    /// The revision assigned to the ops (current revision on failure).
    pub revision: u64,
}

/// A change observed through a watch.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A key was created or updated.
    Put(KvEntry),
    /// A key was deleted.
    Delete {
        /// The deleted key.
        key: String,
        /// Revision at which the delete happened.
        mod_revision: u64,
    },
}

impl WatchEvent {
    /// Returns the key the event refers to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put(entry) => &entry.key,
            Self::Delete { key, .. } => key,
        }
    }

    /// Returns the revision the event was committed at.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        match self {
            Self::Put(entry) => entry.mod_revision,
            Self::Delete { mod_revision, .. } => *mod_revision,
        }
    }
}

/// Coordination KV store.
///
/// Semantics follow distributed KV services with MVCC revisions:
/// a single store-wide revision counter, per-key mod revisions,
/// atomic transactions, ordered watches and TTL leases.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Reads a single key.
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Lists all keys with the given prefix, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>>;

    /// Writes a key unconditionally. Returns the new mod revision.
    async fn put(&self, key: &str, value: Bytes) -> Result<u64>;

    /// Writes a key attached to a lease. Returns the new mod revision.
    async fn put_with_lease(&self, key: &str, value: Bytes, lease: LeaseId) -> Result<u64>;

    /// Deletes a key. Idempotent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Executes an atomic compare-and-swap transaction.
    async fn txn(&self, request: TxnRequest) -> Result<TxnResult>;

    /// Watches a key prefix, replaying history after `from_revision`
    /// and then streaming live events in revision order.
    async fn watch(&self, prefix: &str, from_revision: u64) -> Result<mpsc::UnboundedReceiver<WatchEvent>>;

    /// Grants a lease with the given TTL.
    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId>;

    /// Extends a lease back to its full TTL.
    ///
    /// Returns `NotFound` if the lease has already expired.
    async fn lease_keepalive(&self, lease: LeaseId) -> Result<()>;

    /// Revokes a lease, deleting its attached keys.
    async fn lease_revoke(&self, lease: LeaseId) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Stored {
    value: Bytes,
    mod_revision: u64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseState {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    revision: u64,
    next_lease: u64,
    entries: BTreeMap<String, Stored>,
    leases: HashMap<u64, LeaseState>,
    history: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn emit(&mut self, event: WatchEvent) {
        self.watchers
            .retain(|w| !event.key().starts_with(&w.prefix) || w.tx.send(event.clone()).is_ok());
        self.history.push(event);
    }

    fn apply_put(&mut self, key: &str, value: Bytes, lease: Option<LeaseId>, revision: u64) {
        if let Some(lease_id) = lease {
            if let Some(state) = self.leases.get_mut(&lease_id.as_u64()) {
                state.keys.insert(key.to_string());
            }
        }
        self.entries.insert(
            key.to_string(),
            Stored {
                value: value.clone(),
                mod_revision: revision,
                lease,
            },
        );
        self.emit(WatchEvent::Put(KvEntry {
            key: key.to_string(),
            value,
            mod_revision: revision,
            lease,
        }));
    }

    fn apply_delete(&mut self, key: &str, revision: u64) {
        if let Some(stored) = self.entries.remove(key) {
            if let Some(lease_id) = stored.lease {
                if let Some(state) = self.leases.get_mut(&lease_id.as_u64()) {
                    state.keys.remove(key);
                }
            }
            self.emit(WatchEvent::Delete {
                key: key.to_string(),
                mod_revision: revision,
            });
        }
    }

    /// Expires overdue leases, deleting their keys.
    fn sweep(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .leases
            .iter()
            .filter(|(_, state)| state.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease_id in expired {
            if let Some(state) = self.leases.remove(&lease_id) {
                let mut keys: Vec<String> = state.keys.into_iter().collect();
                keys.sort();
                for key in keys {
                    let revision = self.bump();
                    self.apply_delete(&key, revision);
                }
            }
        }
    }
}

/// In-process [`KvStore`] implementation.
///
/// Single store-wide mutex; every operation sweeps expired leases
/// first so lease expiry is deterministic without a background task.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::internal("kv lock poisoned"))?;
        inner.sweep(Instant::now());
        Ok(inner)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let inner = self.lock()?;
        Ok(inner.entries.get(key).map(|stored| KvEntry {
            key: key.to_string(),
            value: stored.value.clone(),
            mod_revision: stored.mod_revision,
            lease: stored.lease,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, stored)| KvEntry {
                key: k.clone(),
                value: stored.value.clone(),
                mod_revision: stored.mod_revision,
                lease: stored.lease,
            })
            .collect())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<u64> {
        let mut inner = self.lock()?;
        let revision = inner.bump();
        inner.apply_put(key, value, None, revision);
        Ok(revision)
    }

    async fn put_with_lease(&self, key: &str, value: Bytes, lease: LeaseId) -> Result<u64> {
        let mut inner = self.lock()?;
        if !inner.leases.contains_key(&lease.as_u64()) {
            return Err(Error::not_found("lease", lease.as_u64()));
        }
        let revision = inner.bump();
        inner.apply_put(key, value, Some(lease), revision);
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.entries.contains_key(key) {
            let revision = inner.bump();
            inner.apply_delete(key, revision);
        }
        Ok(())
    }

    async fn txn(&self, request: TxnRequest) -> Result<TxnResult> {
        let mut inner = self.lock()?;

        let pass = request.compares.iter().all(|cmp| {
            match inner.entries.get(&cmp.key) {
                Some(stored) => stored.mod_revision == cmp.revision,
                None => cmp.revision == 0,
            }
        });
        if !pass {
            return Ok(TxnResult {
                succeeded: false,
                revision: inner.revision,
            });
        }

        // A put attached to a dead lease fails the whole transaction.
        for op in &request.ops {
            if let TxnOp::Put {
                lease: Some(lease), ..
            } = op
            {
                if !inner.leases.contains_key(&lease.as_u64()) {
                    return Err(Error::not_found("lease", lease.as_u64()));
                }
            }
        }

        // One revision for the whole transaction, like etcd.
        let revision = inner.bump();
        for op in request.ops {
            match op {
                TxnOp::Put { key, value, lease } => inner.apply_put(&key, value, lease, revision),
                TxnOp::Delete { key } => inner.apply_delete(&key, revision),
            }
        }
        Ok(TxnResult {
            succeeded: true,
            revision,
        })
    }

    async fn watch(
        &self,
        prefix: &str,
        from_revision: u64,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let mut inner = self.lock()?;
        let (tx, rx) = mpsc::unbounded_channel();

        // Replay history first so the subscriber never misses events
        // between its snapshot and the live stream.
        for event in &inner.history {
            if event.revision() > from_revision && event.key().starts_with(prefix) {
                let _ = tx.send(event.clone());
            }
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId> {
        let mut inner = self.lock()?;
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            LeaseState {
                ttl,
                expires_at: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(LeaseId(id))
    }

    async fn lease_keepalive(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.lock()?;
        let state = inner
            .leases
            .get_mut(&lease.as_u64())
            .ok_or_else(|| Error::not_found("lease", lease.as_u64()))?;
        state.expires_at = Instant::now() + state.ttl;
        Ok(())
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(state) = inner.leases.remove(&lease.as_u64()) {
            let mut keys: Vec<String> = state.keys.into_iter().collect();
            keys.sort();
            for key in keys {
                let revision = inner.bump();
                inner.apply_delete(&key, revision);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_bumps_revisions() {
        let kv = MemoryKv::new();
        let r1 = kv.put("a", Bytes::from("1")).await.expect("put");
        let r2 = kv.put("a", Bytes::from("2")).await.expect("put");
        assert!(r2 > r1);

        let entry = kv.get("a").await.expect("get").expect("present");
        assert_eq!(entry.value, Bytes::from("2"));
        assert_eq!(entry.mod_revision, r2);
    }

    #[tokio::test]
    async fn txn_compares_mod_revisions() {
        let kv = MemoryKv::new();
        let rev = kv.put("head", Bytes::from("1")).await.expect("put");

        // Compare passes: applies both ops at one revision.
        let result = kv
            .txn(TxnRequest {
                compares: vec![Compare {
                    key: "head".into(),
                    revision: rev,
                }],
                ops: vec![
                    TxnOp::put("head", Bytes::from("2")),
                    TxnOp::put("entry/2", Bytes::from("e")),
                ],
            })
            .await
            .expect("txn");
        assert!(result.succeeded);

        let head = kv.get("head").await.expect("get").expect("present");
        let entry = kv.get("entry/2").await.expect("get").expect("present");
        assert_eq!(head.mod_revision, entry.mod_revision);

        // Stale compare fails and applies nothing.
        let stale = kv
            .txn(TxnRequest {
                compares: vec![Compare {
                    key: "head".into(),
                    revision: rev,
                }],
                ops: vec![TxnOp::put("head", Bytes::from("3"))],
            })
            .await
            .expect("txn");
        assert!(!stale.succeeded);
        assert_eq!(
            kv.get("head").await.expect("get").expect("present").value,
            Bytes::from("2")
        );
    }

    #[tokio::test]
    async fn txn_absent_compare_uses_zero() {
        let kv = MemoryKv::new();
        let result = kv
            .txn(TxnRequest {
                compares: vec![Compare {
                    key: "missing".into(),
                    revision: 0,
                }],
                ops: vec![TxnOp::put("missing", Bytes::from("x"))],
            })
            .await
            .expect("txn");
        assert!(result.succeeded);

        // Second writer using the same absent assumption loses.
        let second = kv
            .txn(TxnRequest {
                compares: vec![Compare {
                    key: "missing".into(),
                    revision: 0,
                }],
                ops: vec![TxnOp::put("missing", Bytes::from("y"))],
            })
            .await
            .expect("txn");
        assert!(!second.succeeded);
    }

    #[tokio::test]
    async fn watch_replays_then_streams() {
        let kv = MemoryKv::new();
        kv.put("wal/entries/1", Bytes::from("a")).await.expect("put");
        kv.put("other/x", Bytes::from("b")).await.expect("put");

        let mut rx = kv.watch("wal/", 0).await.expect("watch");
        let replayed = rx.recv().await.expect("event");
        assert_eq!(replayed.key(), "wal/entries/1");

        kv.put("wal/entries/2", Bytes::from("c")).await.expect("put");
        let live = rx.recv().await.expect("event");
        assert_eq!(live.key(), "wal/entries/2");
    }

    #[tokio::test]
    async fn expired_lease_deletes_keys() {
        let kv = MemoryKv::new();
        let lease = kv
            .lease_grant(Duration::from_millis(5))
            .await
            .expect("grant");
        kv.put_with_lease("executors/e1", Bytes::from("x"), lease)
            .await
            .expect("put");

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(kv.get("executors/e1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn keepalive_extends_lease() {
        let kv = MemoryKv::new();
        let lease = kv
            .lease_grant(Duration::from_millis(50))
            .await
            .expect("grant");
        kv.put_with_lease("executors/e1", Bytes::from("x"), lease)
            .await
            .expect("put");

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            kv.lease_keepalive(lease).await.expect("keepalive");
        }

        assert!(kv.get("executors/e1").await.expect("get").is_some());

        kv.lease_revoke(lease).await.expect("revoke");
        assert!(kv.get("executors/e1").await.expect("get").is_none());
    }
}
