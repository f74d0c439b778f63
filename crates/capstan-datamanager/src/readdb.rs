//! ReadDB: the in-memory projection of the committed WAL.
//!
//! The projection bootstraps from the highest committed checkpoint,
//! replays the WAL tail, then follows the KV watch stream. Read
//! transactions are snapshots: the current state lives behind an
//! `Arc` that is swapped atomically per applied entry, so a
//! transaction sees one consistent `(checkpoint, tail)` point and
//! never blocks the applier.

use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::watch;

use capstan_core::kv::{KvStore, WatchEvent};
use capstan_core::paths;
use capstan_core::storage::StorageBackend;
use capstan_core::{Error, Result};

use crate::action::DataType;
use crate::changegroup::ChangeGroupsUpdateToken;
use crate::checkpoint::load_snapshot_for_reader;
use crate::wal::{resolve_action_data, WalEntry};

/// The projected state at one WAL position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbState {
    /// Newest applied WAL sequence.
    pub applied_seq: u64,
    /// Newest applied KV revision.
    pub applied_revision: u64,
    /// Entity payloads: data type string → id → payload.
    pub data: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    /// Changegroup name → revision it was last bumped at.
    pub change_groups: HashMap<String, u64>,
}

struct Inner {
    kv: Arc<dyn KvStore>,
    storage: Arc<dyn StorageBackend>,
    state: RwLock<Arc<DbState>>,
    seq_tx: watch::Sender<u64>,
}

/// The ReadDB projection.
#[derive(Clone)]
pub struct ReadDb {
    inner: Arc<Inner>,
}

impl ReadDb {
    /// Creates a ReadDB over the coordination KV and object store.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, storage: Arc<dyn StorageBackend>) -> Self {
        let (seq_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                kv,
                storage,
                state: RwLock::new(Arc::new(DbState::default())),
                seq_tx,
            }),
        }
    }

    /// Bootstraps the projection and starts tailing the WAL.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint or WAL tail cannot be read.
    pub async fn start(&self) -> Result<()> {
        let mut state = DbState::default();

        if let Some(snapshot) =
            load_snapshot_for_reader(&self.inner.kv, &self.inner.storage).await?
        {
            state.applied_seq = snapshot.seq;
            state.data = snapshot.data;
        }

        // Changegroup revisions and the WAL tail, tracking the highest
        // KV revision seen so the watch resumes without gaps.
        for entry in self.inner.kv.list(paths::CHANGE_GROUP_PREFIX).await? {
            let name = entry
                .key
                .strip_prefix(paths::CHANGE_GROUP_PREFIX)
                .unwrap_or(&entry.key)
                .to_string();
            state.change_groups.insert(name, entry.mod_revision);
            state.applied_revision = state.applied_revision.max(entry.mod_revision);
        }

        let mut tail = Vec::new();
        for kv_entry in self.inner.kv.list(paths::WAL_ENTRY_PREFIX).await? {
            let wal_entry: WalEntry = serde_json::from_slice(&kv_entry.value)?;
            state.applied_revision = state.applied_revision.max(kv_entry.mod_revision);
            if wal_entry.seq > state.applied_seq {
                tail.push(wal_entry);
            }
        }
        tail.sort_by_key(|e| e.seq);
        for entry in tail {
            apply_entry(self.inner.storage.as_ref(), &mut state, &entry).await?;
        }

        let applied_seq = state.applied_seq;
        let from_revision = state.applied_revision;
        *self
            .inner
            .state
            .write()
            .map_err(|_| Error::internal("readdb lock poisoned"))? = Arc::new(state);
        let _ = self.inner.seq_tx.send(applied_seq);

        let rx = self.inner.kv.watch("", from_revision).await?;
        tokio::spawn(tail_wal(Arc::downgrade(&self.inner), rx));

        Ok(())
    }

    /// Runs `f` under a read transaction.
    ///
    /// The transaction sees a consistent snapshot; two reads inside
    /// one transaction always agree.
    ///
    /// # Errors
    ///
    /// Propagates errors from `f`.
    pub fn do_read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTx) -> Result<T>,
    {
        let state = self
            .inner
            .state
            .read()
            .map_err(|_| Error::internal("readdb lock poisoned"))?
            .clone();
        f(&ReadTx { state })
    }

    /// Waits until the projection has applied `seq`.
    ///
    /// Used by writers that need to read their own writes.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the projection stopped.
    pub async fn wait_for_seq(&self, seq: u64) -> Result<()> {
        let mut rx = self.inner.seq_tx.subscribe();
        rx.wait_for(|applied| *applied >= seq)
            .await
            .map_err(|_| Error::unavailable("readdb projection stopped"))?;
        Ok(())
    }

    /// Returns the current state snapshot (for diagnostics and tests).
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the state lock is poisoned.
    pub fn state(&self) -> Result<Arc<DbState>> {
        Ok(self
            .inner
            .state
            .read()
            .map_err(|_| Error::internal("readdb lock poisoned"))?
            .clone())
    }
}

/// A consistent snapshot read transaction.
pub struct ReadTx {
    state: Arc<DbState>,
}

impl ReadTx {
    /// Returns the raw payload of one entity.
    #[must_use]
    pub fn get(&self, data_type: DataType, id: &str) -> Option<&serde_json::Value> {
        self.state.data.get(data_type.as_str())?.get(id)
    }

    /// Returns one entity deserialized as `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored payload does not deserialize.
    pub fn get_as<T: DeserializeOwned>(&self, data_type: DataType, id: &str) -> Result<Option<T>> {
        self.get(data_type, id)
            .map(|value| serde_json::from_value(value.clone()).map_err(Error::from))
            .transpose()
    }

    /// Iterates every entity of a data type, ordered by id.
    pub fn all(&self, data_type: DataType) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.state
            .data
            .get(data_type.as_str())
            .into_iter()
            .flatten()
    }

    /// Returns every entity of a data type deserialized as `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if any stored payload does not deserialize.
    pub fn all_as<T: DeserializeOwned>(&self, data_type: DataType) -> Result<Vec<T>> {
        self.all(data_type)
            .map(|(_, value)| serde_json::from_value(value.clone()).map_err(Error::from))
            .collect()
    }

    /// Newest applied WAL sequence visible to this transaction.
    #[must_use]
    pub fn applied_seq(&self) -> u64 {
        self.state.applied_seq
    }

    /// Captures changegroup tokens for a later `write_wal`.
    ///
    /// Groups never bumped are captured at revision 0, which asserts
    /// "still untouched" at write time.
    #[must_use]
    pub fn change_group_tokens(&self, names: &[String]) -> ChangeGroupsUpdateToken {
        let mut token = ChangeGroupsUpdateToken::default();
        for name in names {
            token.revisions.insert(
                name.clone(),
                self.state.change_groups.get(name).copied().unwrap_or(0),
            );
        }
        token
    }
}

async fn apply_entry<S: StorageBackend + ?Sized>(
    storage: &S,
    state: &mut DbState,
    entry: &WalEntry,
) -> Result<()> {
    if entry.seq <= state.applied_seq {
        return Ok(());
    }
    for action in &entry.actions {
        let data = resolve_action_data(storage, action).await?;
        match action.action_type {
            crate::action::ActionType::Put => {
                if let Some(value) = data {
                    state
                        .data
                        .entry(action.data_type.as_str().to_string())
                        .or_default()
                        .insert(action.id.clone(), value);
                }
            }
            crate::action::ActionType::Delete => {
                if let Some(entities) = state.data.get_mut(action.data_type.as_str()) {
                    entities.remove(&action.id);
                }
            }
        }
    }
    state.applied_seq = entry.seq;
    Ok(())
}

async fn tail_wal(
    inner: Weak<Inner>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<WatchEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };

        let result = async {
            match &event {
                WatchEvent::Put(entry) if entry.key.starts_with(paths::WAL_ENTRY_PREFIX) => {
                    let wal_entry: WalEntry = serde_json::from_slice(&entry.value)?;
                    let current = inner
                        .state
                        .read()
                        .map_err(|_| Error::internal("readdb lock poisoned"))?
                        .clone();
                    let mut next = (*current).clone();
                    apply_entry(inner.storage.as_ref(), &mut next, &wal_entry).await?;
                    next.applied_revision = next.applied_revision.max(entry.mod_revision);
                    let applied = next.applied_seq;
                    *inner
                        .state
                        .write()
                        .map_err(|_| Error::internal("readdb lock poisoned"))? = Arc::new(next);
                    let _ = inner.seq_tx.send(applied);
                }
                WatchEvent::Put(entry) if entry.key.starts_with(paths::CHANGE_GROUP_PREFIX) => {
                    let name = entry
                        .key
                        .strip_prefix(paths::CHANGE_GROUP_PREFIX)
                        .unwrap_or(&entry.key)
                        .to_string();
                    let current = inner
                        .state
                        .read()
                        .map_err(|_| Error::internal("readdb lock poisoned"))?
                        .clone();
                    let mut next = (*current).clone();
                    next.change_groups.insert(name, entry.mod_revision);
                    next.applied_revision = next.applied_revision.max(entry.mod_revision);
                    *inner
                        .state
                        .write()
                        .map_err(|_| Error::internal("readdb lock poisoned"))? = Arc::new(next);
                }
                // Head updates, executor registrations and WAL entry
                // GC deletes don't change projected entities.
                _ => {}
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, key = event.key(), "readdb failed to apply event");
        }
    }
}
