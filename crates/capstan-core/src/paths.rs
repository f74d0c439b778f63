//! Persisted key layout for the object store and the coordination KV.
//!
//! Object store keys use `/` as separator:
//!
//! - `wal/<seq>` payloads spilled per entry under `waldata/<hash>`
//! - `snapshots/<seq>` checkpoint snapshots
//! - `data/<dataType>/<id>` checkpointed entity payloads
//! - `logs/<runID>/<taskID>/<step>` task step logs
//! - `artifacts/<runID>/<taskID>/<name>` task artifacts
//!
//! KV keys live under short prefixes (`wal/`, `changegroups/`,
//! `executors/`, `election/`).

/// KV key of the WAL head marker.
pub const WAL_HEAD_KEY: &str = "wal/head";

/// KV key prefix of committed WAL entries.
pub const WAL_ENTRY_PREFIX: &str = "wal/entries/";

/// KV key of the committed checkpoint sequence marker.
pub const CHECKPOINT_KEY: &str = "wal/checkpoint";

/// KV key prefix of changegroup revision markers.
pub const CHANGE_GROUP_PREFIX: &str = "changegroups/";

/// KV key prefix of executor registrations (ephemeral, lease-bound).
pub const EXECUTOR_PREFIX: &str = "executors/";

/// KV election key for the datamanager write leader.
pub const WAL_LEADER_KEY: &str = "election/wal-writer";

/// Returns the KV key of a WAL entry.
///
/// Sequence numbers are zero-padded so lexicographic key order equals
/// numeric order.
#[must_use]
pub fn wal_entry_key(seq: u64) -> String {
    format!("{WAL_ENTRY_PREFIX}{seq:020}")
}

/// Parses the sequence number out of a WAL entry key.
#[must_use]
pub fn wal_entry_seq(key: &str) -> Option<u64> {
    key.strip_prefix(WAL_ENTRY_PREFIX)?.parse().ok()
}

/// Returns the KV key of a changegroup revision marker.
#[must_use]
pub fn change_group_key(name: &str) -> String {
    format!("{CHANGE_GROUP_PREFIX}{name}")
}

/// Returns the KV key of an executor registration.
#[must_use]
pub fn executor_key(executor_id: &str) -> String {
    format!("{EXECUTOR_PREFIX}{executor_id}")
}

/// Returns the object store path of a spilled WAL payload
/// (content-addressed).
#[must_use]
pub fn wal_data_path(hash: &str) -> String {
    format!("waldata/{hash}")
}

/// Returns the object store path of a checkpoint snapshot.
#[must_use]
pub fn snapshot_path(seq: u64) -> String {
    format!("snapshots/{seq:020}")
}

/// Returns the object store path of a checkpointed entity payload.
#[must_use]
pub fn data_path(data_type: &str, id: &str) -> String {
    format!("data/{data_type}/{id}")
}

/// Returns the object store path of one step's log.
///
/// `step` is the zero-based step index, or `setup` for the setup step.
#[must_use]
pub fn log_path(run_id: &str, task_id: &str, step: &str) -> String {
    format!("logs/{run_id}/{task_id}/{step}")
}

/// Returns the object store prefix holding all logs of a run.
#[must_use]
pub fn run_logs_prefix(run_id: &str) -> String {
    format!("logs/{run_id}/")
}

/// Returns the object store path of a task artifact.
#[must_use]
pub fn artifact_path(run_id: &str, task_id: &str, name: &str) -> String {
    format!("artifacts/{run_id}/{task_id}/{name}")
}

/// Returns the object store prefix holding all artifacts of a run.
#[must_use]
pub fn run_artifacts_prefix(run_id: &str) -> String {
    format!("artifacts/{run_id}/")
}
