//! The write-ahead log: linearizable action batches over the
//! coordination KV.
//!
//! Every state change is one WAL entry, committed by a single
//! compare-and-swap transaction that checks the WAL head revision and
//! every changegroup the writer captured. Entries are totally ordered
//! by sequence number. Large payloads are spilled to the object store
//! content-addressed; small payloads live inline in the entry.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use capstan_core::kv::{Compare, KvStore, TxnOp, TxnRequest};
use capstan_core::paths;
use capstan_core::storage::{StorageBackend, WritePrecondition};
use capstan_core::{Error, Result};

use crate::action::{Action, ActionType, DataType};
use crate::changegroup::{derived_groups, ChangeGroupsUpdateToken};
use crate::metrics_names;

/// Payloads above this size are spilled to the object store.
pub const SPILL_THRESHOLD: usize = 16 * 1024;

/// Head-CAS retries before giving up. Changegroup conflicts are never
/// retried here; they surface to the caller.
const MAX_HEAD_RETRIES: u32 = 10;

/// The WAL head marker stored in the KV.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WalHead {
    /// Sequence number of the newest committed entry.
    pub seq: u64,
}

/// One action inside a committed WAL entry.
///
/// Exactly one of `data` / `data_ref` is set for puts; deletes carry
/// neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalAction {
    /// Put or delete.
    pub action_type: ActionType,
    /// The entity class.
    pub data_type: DataType,
    /// The entity id.
    pub id: String,
    /// Inline payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Content-addressed object store handle of a spilled payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_ref: Option<String>,
}

/// A committed WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Sequence number (total order).
    pub seq: u64,
    /// Commit wall-clock time.
    pub timestamp: DateTime<Utc>,
    /// The actions applied by this entry, in order.
    pub actions: Vec<WalAction>,
    /// Hashed changegroup names bumped by this entry.
    pub change_groups: Vec<String>,
}

/// The datamanager: owns the WAL write path.
///
/// The process holding the WAL leader lease serializes writes through
/// one instance of this type; an internal mutex serializes writers
/// within the process, the head CAS protects against a stale leader.
pub struct DataManager {
    kv: Arc<dyn KvStore>,
    storage: Arc<dyn StorageBackend>,
    write_lock: tokio::sync::Mutex<()>,
}

impl DataManager {
    /// Creates a datamanager over the coordination KV and object store.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            kv,
            storage,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the coordination KV this datamanager writes through.
    #[must_use]
    pub fn kv(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }

    /// Returns the object store this datamanager spills into.
    #[must_use]
    pub fn storage(&self) -> Arc<dyn StorageBackend> {
        self.storage.clone()
    }

    /// Commits an ordered batch of actions as one WAL entry.
    ///
    /// `cgt` carries the changegroup revisions captured inside the
    /// read transaction that produced `actions`. The entry bumps every
    /// group named in the token plus the per-entity group derived from
    /// each action.
    ///
    /// # Errors
    ///
    /// - `BadRequest` for malformed actions
    /// - `Conflict` if any captured changegroup was bumped since, or
    ///   head contention persists beyond the retry budget
    #[tracing::instrument(skip(self, actions, cgt), fields(actions = actions.len()))]
    pub async fn write_wal(
        &self,
        actions: Vec<Action>,
        cgt: Option<&ChangeGroupsUpdateToken>,
    ) -> Result<u64> {
        if actions.is_empty() {
            return Err(Error::bad_request("write_wal requires at least one action"));
        }
        for action in &actions {
            action.validate()?;
        }

        let wal_actions = self.spill_actions(actions).await?;

        // Union of explicit token groups and per-action derived groups.
        let mut groups: BTreeSet<String> = wal_actions
            .iter()
            .map(|a| {
                derived_groups(&Action {
                    action_type: a.action_type,
                    data_type: a.data_type,
                    id: a.id.clone(),
                    data: None,
                })
            })
            .collect();
        if let Some(token) = cgt {
            groups.extend(token.revisions.keys().cloned());
        }

        let _serialized = self.write_lock.lock().await;

        for attempt in 0..MAX_HEAD_RETRIES {
            let head = self.kv.get(paths::WAL_HEAD_KEY).await?;
            let (head_seq, head_rev) = match &head {
                Some(entry) => {
                    let parsed: WalHead = serde_json::from_slice(&entry.value)?;
                    (parsed.seq, entry.mod_revision)
                }
                None => (0, 0),
            };
            let seq = head_seq + 1;

            let entry = WalEntry {
                seq,
                timestamp: Utc::now(),
                actions: wal_actions.clone(),
                change_groups: groups.iter().cloned().collect(),
            };

            let mut compares = vec![Compare {
                key: paths::WAL_HEAD_KEY.to_string(),
                revision: head_rev,
            }];
            if let Some(token) = cgt {
                let mut named: Vec<_> = token.revisions.iter().collect();
                named.sort();
                for (name, revision) in named {
                    compares.push(Compare {
                        key: paths::change_group_key(name),
                        revision: *revision,
                    });
                }
            }

            // Group bumps precede the entry so projections that use
            // the entry as a barrier already see the new revisions.
            let mut ops: Vec<TxnOp> = groups
                .iter()
                .map(|group| {
                    TxnOp::put(paths::change_group_key(group), Bytes::from(seq.to_string()))
                })
                .collect();
            ops.push(TxnOp::put(
                paths::wal_entry_key(seq),
                Bytes::from(serde_json::to_vec(&entry)?),
            ));
            ops.push(TxnOp::put(
                paths::WAL_HEAD_KEY,
                Bytes::from(serde_json::to_vec(&WalHead { seq })?),
            ));

            let result = self.kv.txn(TxnRequest { compares, ops }).await?;
            if result.succeeded {
                counter!(metrics_names::WAL_WRITES_TOTAL).increment(1);
                tracing::debug!(seq, "wal entry committed");
                return Ok(seq);
            }

            // Distinguish a stale token (caller's problem) from plain
            // head contention (retry here).
            if let Some(token) = cgt {
                for (name, captured) in &token.revisions {
                    let current = self
                        .kv
                        .get(&paths::change_group_key(name))
                        .await?
                        .map_or(0, |e| e.mod_revision);
                    if current != *captured {
                        counter!(metrics_names::WAL_CONFLICTS_TOTAL).increment(1);
                        return Err(Error::conflict(format!(
                            "changegroup {name} updated since token capture"
                        )));
                    }
                }
            }

            tracing::debug!(attempt, "wal head moved, retrying");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        counter!(metrics_names::WAL_CONFLICTS_TOTAL).increment(1);
        Err(Error::conflict("wal head contention persisted"))
    }

    /// Returns the newest committed sequence number (0 = empty log).
    ///
    /// # Errors
    ///
    /// Returns an error if the KV store is unreachable.
    pub async fn head_seq(&self) -> Result<u64> {
        match self.kv.get(paths::WAL_HEAD_KEY).await? {
            Some(entry) => {
                let head: WalHead = serde_json::from_slice(&entry.value)?;
                Ok(head.seq)
            }
            None => Ok(0),
        }
    }

    /// Reads one committed WAL entry.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the entry was never committed or already
    /// garbage collected.
    pub async fn read_entry(&self, seq: u64) -> Result<WalEntry> {
        let key = paths::wal_entry_key(seq);
        let entry = self
            .kv
            .get(&key)
            .await?
            .ok_or_else(|| Error::not_found("wal entry", seq))?;
        Ok(serde_json::from_slice(&entry.value)?)
    }

    /// Lists committed entries with sequence greater than
    /// `after_seq`, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the KV store is unreachable.
    pub async fn entries_after(&self, after_seq: u64) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();
        for kv_entry in self.kv.list(paths::WAL_ENTRY_PREFIX).await? {
            let Some(seq) = paths::wal_entry_seq(&kv_entry.key) else {
                continue;
            };
            if seq > after_seq {
                entries.push(serde_json::from_slice(&kv_entry.value)?);
            }
        }
        entries.sort_by_key(|e: &WalEntry| e.seq);
        Ok(entries)
    }

    /// Resolves an action's payload, fetching spilled data if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if a spilled payload is missing or unreadable.
    pub async fn resolve_action_data(
        &self,
        action: &WalAction,
    ) -> Result<Option<serde_json::Value>> {
        resolve_action_data(self.storage.as_ref(), action).await
    }

    async fn spill_actions(&self, actions: Vec<Action>) -> Result<Vec<WalAction>> {
        let mut wal_actions = Vec::with_capacity(actions.len());
        for action in actions {
            let mut wal_action = WalAction {
                action_type: action.action_type,
                data_type: action.data_type,
                id: action.id,
                data: None,
                data_ref: None,
            };
            if let Some(data) = action.data {
                let raw = serde_json::to_vec(&data)?;
                if raw.len() > SPILL_THRESHOLD {
                    let hash = hex::encode(Sha256::digest(&raw));
                    // Content-addressed: a precondition failure means
                    // the identical payload is already there.
                    let _ = self
                        .storage
                        .put(
                            &paths::wal_data_path(&hash),
                            Bytes::from(raw),
                            WritePrecondition::DoesNotExist,
                        )
                        .await?;
                    wal_action.data_ref = Some(hash);
                } else {
                    wal_action.data = Some(data);
                }
            }
            wal_actions.push(wal_action);
        }
        Ok(wal_actions)
    }
}

/// Resolves an action's payload against the given object store.
///
/// # Errors
///
/// Returns an error if a spilled payload is missing or unreadable.
pub async fn resolve_action_data<S: StorageBackend + ?Sized>(
    storage: &S,
    action: &WalAction,
) -> Result<Option<serde_json::Value>> {
    if let Some(data) = &action.data {
        return Ok(Some(data.clone()));
    }
    let Some(hash) = &action.data_ref else {
        return Ok(None);
    };
    let raw = storage.get(&paths::wal_data_path(hash)).await?;
    Ok(Some(serde_json::from_slice(&raw)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changegroup::name_group;
    use capstan_core::{MemoryBackend, MemoryKv};

    fn manager() -> DataManager {
        DataManager::new(Arc::new(MemoryKv::new()), Arc::new(MemoryBackend::new()))
    }

    fn put_action(id: &str) -> Action {
        Action::put(DataType::Secret, id, &serde_json::json!({"name": id})).expect("action")
    }

    #[tokio::test]
    async fn writes_are_sequenced() {
        let dm = manager();
        let s1 = dm.write_wal(vec![put_action("a")], None).await.expect("write");
        let s2 = dm.write_wal(vec![put_action("b")], None).await.expect("write");
        assert_eq!((s1, s2), (1, 2));
        assert_eq!(dm.head_seq().await.expect("head"), 2);

        let entry = dm.read_entry(2).await.expect("entry");
        assert_eq!(entry.actions[0].id, "b");
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let dm = manager();
        let err = dm.write_wal(vec![], None).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[tokio::test]
    async fn stale_token_conflicts() {
        let dm = manager();
        let group = name_group(DataType::Secret, "x");

        // Both writers captured the group as never-bumped.
        let mut token = ChangeGroupsUpdateToken::default();
        token.revisions.insert(group.clone(), 0);

        dm.write_wal(vec![put_action("first")], Some(&token))
            .await
            .expect("first write wins");

        let err = dm
            .write_wal(vec![put_action("second")], Some(&token))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn disjoint_tokens_both_succeed() {
        let dm = manager();

        let mut token_a = ChangeGroupsUpdateToken::default();
        token_a
            .revisions
            .insert(name_group(DataType::Secret, "a"), 0);
        let mut token_b = ChangeGroupsUpdateToken::default();
        token_b
            .revisions
            .insert(name_group(DataType::Secret, "b"), 0);

        dm.write_wal(vec![put_action("a")], Some(&token_a))
            .await
            .expect("a");
        dm.write_wal(vec![put_action("b")], Some(&token_b))
            .await
            .expect("b");
    }

    #[tokio::test]
    async fn large_payloads_spill_to_storage() {
        let dm = manager();
        let big = serde_json::json!({"blob": "x".repeat(SPILL_THRESHOLD + 1)});
        let action = Action::put(DataType::Run, "r1", &big).expect("action");

        let seq = dm.write_wal(vec![action], None).await.expect("write");
        let entry = dm.read_entry(seq).await.expect("entry");

        let wal_action = &entry.actions[0];
        assert!(wal_action.data.is_none());
        assert!(wal_action.data_ref.is_some());

        let resolved = dm
            .resolve_action_data(wal_action)
            .await
            .expect("resolve")
            .expect("payload");
        assert_eq!(resolved, big);
    }

    #[tokio::test]
    async fn entries_after_filters_and_orders() {
        let dm = manager();
        for id in ["a", "b", "c"] {
            dm.write_wal(vec![put_action(id)], None).await.expect("write");
        }
        let tail = dm.entries_after(1).await.expect("entries");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 2);
        assert_eq!(tail[1].seq, 3);
    }
}
