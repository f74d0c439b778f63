//! Changegroups: named optimistic-lock buckets.
//!
//! A writer captures [`ChangeGroupsUpdateToken`]s inside a ReadDB
//! transaction and passes them to `write_wal`; the write fails with
//! `Conflict` if any named group was bumped since capture. Group names
//! are hashed so arbitrary entity names stay KV-safe.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::action::{Action, DataType};

/// Hashes a plain changegroup name into its stored form.
#[must_use]
pub fn change_group_name(plain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plain.as_bytes());
    hex::encode(hasher.finalize())
}

/// Changegroup guarding an entity name within a data type
/// (e.g. `secretname-<name>`); used to serialize create-by-name.
#[must_use]
pub fn name_group(data_type: DataType, name: &str) -> String {
    change_group_name(&format!("{}name-{name}", data_type.as_str()))
}

/// Changegroup guarding a single entity by id
/// (e.g. `runid-<id>`); bumped by every WAL action touching the entity.
#[must_use]
pub fn id_group(data_type: DataType, id: &str) -> String {
    change_group_name(&format!("{}id-{id}", data_type.as_str()))
}

/// Changegroup guarding an executor's registration/capacity.
#[must_use]
pub fn executor_group(executor_id: &str) -> String {
    change_group_name(&format!("executorid-{executor_id}"))
}

/// The changegroups an action implicitly bumps.
#[must_use]
pub fn derived_groups(action: &Action) -> String {
    id_group(action.data_type, &action.id)
}

/// Optimistic concurrency token over a set of changegroups.
///
/// Maps hashed group name to the KV revision the group was last bumped
/// at when the token was captured; `0` means the group had never been
/// bumped. Stale tokens make `write_wal` fail with `Conflict`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeGroupsUpdateToken {
    /// Hashed group name to captured revision.
    pub revisions: HashMap<String, u64>,
}

impl ChangeGroupsUpdateToken {
    /// Returns true if the token names no groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Merges another token into this one.
    ///
    /// Both tokens must come from the same read transaction for the
    /// combined compare to be meaningful.
    pub fn merge(&mut self, other: Self) {
        self.revisions.extend(other.revisions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_names_are_hashed_and_stable() {
        let a = name_group(DataType::Secret, "prod-token");
        let b = name_group(DataType::Secret, "prod-token");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, name_group(DataType::Variable, "prod-token"));
    }

    #[test]
    fn id_groups_differ_per_entity() {
        assert_ne!(
            id_group(DataType::Run, "r1"),
            id_group(DataType::Run, "r2")
        );
    }

    #[test]
    fn merge_combines_revisions() {
        let mut token = ChangeGroupsUpdateToken::default();
        token.revisions.insert("a".into(), 3);
        let mut other = ChangeGroupsUpdateToken::default();
        other.revisions.insert("b".into(), 0);
        token.merge(other);
        assert_eq!(token.revisions.len(), 2);
    }
}
