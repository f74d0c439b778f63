//! # capstan-core
//!
//! Core abstractions for the Capstan run scheduling platform.
//!
//! This crate provides the foundational types and traits used across
//! all Capstan components:
//!
//! - **Identifiers**: Strongly-typed ULID ids for runs, executors,
//!   secrets, variables and projects
//! - **Object storage**: Abstract blob storage with CAS preconditions
//! - **Coordination KV**: Atomic transactions, watches, leases and
//!   leader election
//! - **Persisted layout**: Key layout of the WAL, checkpoints, logs
//!   and artifacts
//! - **Error taxonomy**: Shared error definitions and result types
//!
//! `capstan-core` is the only crate allowed to define shared
//! primitives; all cross-component interaction goes through the
//! contracts defined here.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod election;
pub mod error;
pub mod id;
pub mod kv;
pub mod object_store_backend;
pub mod observability;
pub mod paths;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{Config, ObjectStorageConfig, ObjectStorageType};
    pub use crate::error::{Error, Result};
    pub use crate::id::{
        ExecutorId, ProjectGroupId, ProjectId, RunId, SecretId, TaskId, VariableId,
    };
    pub use crate::kv::{Compare, KvEntry, KvStore, LeaseId, TxnOp, TxnRequest, WatchEvent};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

pub use config::{Config, EtcdConfig, ObjectStorageConfig, ObjectStorageType};
pub use election::{Campaign, LeaderElection, LeaderLease};
pub use error::{Error, Result};
pub use id::{ExecutorId, ProjectGroupId, ProjectId, RunId, SecretId, TaskId, VariableId};
pub use kv::{Compare, KvEntry, KvStore, LeaseId, MemoryKv, TxnOp, TxnRequest, TxnResult, WatchEvent};
pub use object_store_backend::ObjectStoreBackend;
pub use observability::{init_logging, LogFormat};
pub use storage::{
    delete_prefix, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};
