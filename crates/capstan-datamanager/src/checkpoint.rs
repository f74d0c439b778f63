//! Checkpointing: compacting a WAL prefix into an object store
//! snapshot.
//!
//! The checkpointer folds all committed entries up to the head into a
//! snapshot object, then advances the committed-checkpoint marker with
//! a CAS. The marker only moves after the snapshot object is fully
//! written, so readers always load a complete snapshot; a crash
//! between the two steps leaves the previous checkpoint in effect.

use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use capstan_core::kv::{Compare, KvStore, TxnOp, TxnRequest};
use capstan_core::paths;
use capstan_core::storage::{StorageBackend, WritePrecondition};
use capstan_core::{Error, Result};

use crate::action::ActionType;
use crate::metrics_names;
use crate::wal::{resolve_action_data, DataManager};

/// A materialized snapshot of every entity at a WAL sequence.
///
/// Keyed by data type string, then entity id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The WAL sequence this snapshot covers (inclusive).
    pub seq: u64,
    /// Entity payloads: data type → id → payload.
    pub data: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl Snapshot {
    /// Applies one WAL action to the snapshot.
    pub fn apply(
        &mut self,
        action_type: ActionType,
        data_type: &str,
        id: &str,
        data: Option<serde_json::Value>,
    ) {
        match action_type {
            ActionType::Put => {
                if let Some(value) = data {
                    self.data
                        .entry(data_type.to_string())
                        .or_default()
                        .insert(id.to_string(), value);
                }
            }
            ActionType::Delete => {
                if let Some(entities) = self.data.get_mut(data_type) {
                    entities.remove(id);
                }
            }
        }
    }
}

/// The committed checkpoint marker stored in the KV.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CheckpointMarker {
    /// Sequence of the newest committed snapshot (0 = none).
    pub seq: u64,
}

/// Periodic WAL compaction into object store snapshots.
pub struct Checkpointer {
    kv: Arc<dyn KvStore>,
    storage: Arc<dyn StorageBackend>,
    /// Committed entries kept behind the checkpoint for late readers.
    retention: u64,
}

impl Checkpointer {
    /// Creates a checkpointer keeping `retention` entries behind the
    /// checkpoint.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, storage: Arc<dyn StorageBackend>, retention: u64) -> Self {
        Self {
            kv,
            storage,
            retention,
        }
    }

    /// Reads the committed checkpoint marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the KV store is unreachable.
    pub async fn committed_seq(&self) -> Result<u64> {
        match self.kv.get(paths::CHECKPOINT_KEY).await? {
            Some(entry) => {
                let marker: CheckpointMarker = serde_json::from_slice(&entry.value)?;
                Ok(marker.seq)
            }
            None => Ok(0),
        }
    }

    /// Loads the newest fully-committed snapshot, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot object is missing or corrupt.
    pub async fn load_committed_snapshot(&self) -> Result<Option<Snapshot>> {
        let seq = self.committed_seq().await?;
        if seq == 0 {
            return Ok(None);
        }
        let raw = self.storage.get(&paths::snapshot_path(seq)).await?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Rolls the WAL prefix up to the current head into a snapshot and
    /// advances the marker.
    ///
    /// Idempotent: re-running after a crash rewrites the same snapshot
    /// content for the same head. Returns the committed sequence.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or KV failure. A lost marker CAS is
    /// not an error; the other checkpointer won.
    #[tracing::instrument(skip(self, dm))]
    pub async fn checkpoint(&self, dm: &DataManager) -> Result<u64> {
        let head = dm.head_seq().await?;
        let committed = self.committed_seq().await?;
        if head <= committed {
            return Ok(committed);
        }

        let previous = self.load_committed_snapshot().await?.unwrap_or_default();
        let mut snapshot = previous.clone();
        for entry in dm.entries_after(snapshot.seq).await? {
            if entry.seq > head {
                break;
            }
            for action in &entry.actions {
                let data = resolve_action_data(self.storage.as_ref(), action).await?;
                snapshot.apply(action.action_type, action.data_type.as_str(), &action.id, data);
            }
            snapshot.seq = entry.seq;
        }

        // Materialize changed entities under data/<dataType>/<id> and
        // drop the ones this checkpoint no longer contains.
        for (data_type, entities) in &snapshot.data {
            let old_entities = previous.data.get(data_type);
            for (id, value) in entities {
                if old_entities.and_then(|m| m.get(id)) != Some(value) {
                    self.storage
                        .put(
                            &paths::data_path(data_type, id),
                            Bytes::from(serde_json::to_vec(value)?),
                            WritePrecondition::None,
                        )
                        .await?;
                }
            }
        }
        for (data_type, entities) in &previous.data {
            let new_entities = snapshot.data.get(data_type);
            for id in entities.keys() {
                if new_entities.is_none_or(|m| !m.contains_key(id)) {
                    self.storage.delete(&paths::data_path(data_type, id)).await?;
                }
            }
        }

        // Write the snapshot fully before moving the marker.
        self.storage
            .put(
                &paths::snapshot_path(snapshot.seq),
                Bytes::from(serde_json::to_vec(&snapshot)?),
                WritePrecondition::None,
            )
            .await?;

        let marker_entry = self.kv.get(paths::CHECKPOINT_KEY).await?;
        let marker_rev = marker_entry.as_ref().map_or(0, |e| e.mod_revision);
        let result = self
            .kv
            .txn(TxnRequest {
                compares: vec![Compare {
                    key: paths::CHECKPOINT_KEY.to_string(),
                    revision: marker_rev,
                }],
                ops: vec![TxnOp::put(
                    paths::CHECKPOINT_KEY,
                    Bytes::from(serde_json::to_vec(&CheckpointMarker { seq: snapshot.seq })?),
                )],
            })
            .await?;

        if result.succeeded {
            counter!(metrics_names::CHECKPOINTS_TOTAL).increment(1);
            tracing::info!(seq = snapshot.seq, "checkpoint committed");
            Ok(snapshot.seq)
        } else {
            // Another checkpointer advanced the marker concurrently.
            self.committed_seq().await
        }
    }

    /// Deletes WAL entries (and their spilled payloads) below
    /// `checkpoint - retention`.
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or KV failure.
    #[tracing::instrument(skip(self, dm))]
    pub async fn gc(&self, dm: &DataManager) -> Result<usize> {
        let committed = self.committed_seq().await?;
        let cutoff = committed.saturating_sub(self.retention);
        if cutoff == 0 {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in dm.entries_after(0).await? {
            if entry.seq >= cutoff {
                break;
            }
            for action in &entry.actions {
                if let Some(hash) = &action.data_ref {
                    self.storage.delete(&paths::wal_data_path(hash)).await?;
                }
            }
            self.kv.delete(&paths::wal_entry_key(entry.seq)).await?;
            removed += 1;
        }
        if removed > 0 {
            counter!(metrics_names::WAL_GC_ENTRIES_TOTAL).increment(removed as u64);
            tracing::info!(removed, cutoff, "wal entries garbage collected");
        }
        Ok(removed)
    }
}

/// Checkpoint loading helper for readers preferring the highest
/// fully-committed snapshot.
///
/// # Errors
///
/// Returns an error if the marker points at a missing snapshot.
pub async fn load_snapshot_for_reader(
    kv: &Arc<dyn KvStore>,
    storage: &Arc<dyn StorageBackend>,
) -> Result<Option<Snapshot>> {
    let marker = match kv.get(paths::CHECKPOINT_KEY).await? {
        Some(entry) => serde_json::from_slice::<CheckpointMarker>(&entry.value)?,
        None => return Ok(None),
    };
    if marker.seq == 0 {
        return Ok(None);
    }
    match storage.get(&paths::snapshot_path(marker.seq)).await {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(Error::NotFound { .. }) => Err(Error::fatal(format!(
            "checkpoint marker {} points at a missing snapshot",
            marker.seq
        ))),
        Err(e) => Err(e),
    }
}
