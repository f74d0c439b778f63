//! Strongly-typed identifiers for Capstan entities.
//!
//! All generated identifiers are ULIDs: lexicographically sortable by
//! creation time, globally unique without coordination, URL-safe. Task
//! identifiers are an exception - they are caller-chosen string keys
//! scoped to a run config, so they get a string newtype instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! ulid_id {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an identifier from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the identifier.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                let ms = self.0.timestamp_ms();
                chrono::DateTime::from_timestamp_millis(ms as i64)
                    .unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s).map(Self).map_err(|e| {
                    Error::bad_request(format!(concat!("invalid ", $kind, " id '{}': {}"), s, e))
                })
            }
        }
    };
}

ulid_id! {
    /// A unique identifier for a run.
    ///
    /// Runs sort by creation time thanks to the ULID encoding, which
    /// the run listing cursor relies on.
    RunId, "run"
}

ulid_id! {
    /// A unique identifier for a registered executor.
    ExecutorId, "executor"
}

ulid_id! {
    /// A unique identifier for a secret.
    SecretId, "secret"
}

ulid_id! {
    /// A unique identifier for a variable.
    VariableId, "variable"
}

ulid_id! {
    /// A unique identifier for a project.
    ProjectId, "project"
}

ulid_id! {
    /// A unique identifier for a project group.
    ProjectGroupId, "project group"
}

/// A task identifier within a run config.
///
/// Task ids are chosen by the run generator and are stable between the
/// run config and the run; they are unique only within one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task id from a string key.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the task id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique_and_sortable() {
        let a = RunId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = RunId::generate();
        assert_ne!(a, b);
        // ULIDs order across milliseconds.
        assert!(b > a);
    }

    #[test]
    fn run_id_roundtrips_through_string() {
        let id = RunId::generate();
        let parsed: RunId = id.to_string().parse().expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn invalid_run_id_is_bad_request() {
        let err = "not-a-ulid".parse::<RunId>().unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[test]
    fn task_id_is_a_plain_key() {
        let id = TaskId::from("task01");
        assert_eq!(id.as_str(), "task01");
        assert_eq!(id.to_string(), "task01");
    }
}
