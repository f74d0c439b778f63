//! # capstan-datamanager
//!
//! Linearizable persistence for Capstan: a write-ahead log of atomic
//! action batches over the coordination KV and object store, with
//! changegroup optimistic concurrency, periodic checkpoints and the
//! ReadDB projection.
//!
//! ## Write path
//!
//! ```text
//! caller → ReadDB.do_read (capture tokens) → DataManager.write_wal
//!        → CAS txn (head + changegroups) → committed entry
//! ```
//!
//! ## Read path
//!
//! ```text
//! checkpoint snapshot + WAL tail → ReadDB state → snapshot read txns
//! ```
//!
//! Crash safety: a write is either fully committed (the CAS succeeded)
//! or fully absent; the projection re-derives its state from the
//! committed WAL on restart.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod action;
pub mod changegroup;
pub mod checkpoint;
pub mod metrics_names;
pub mod readdb;
pub mod wal;

pub use action::{Action, ActionType, DataType};
pub use changegroup::{
    change_group_name, executor_group, id_group, name_group, ChangeGroupsUpdateToken,
};
pub use checkpoint::{Checkpointer, Snapshot};
pub use readdb::{DbState, ReadDb, ReadTx};
pub use wal::{DataManager, WalAction, WalEntry, SPILL_THRESHOLD};
