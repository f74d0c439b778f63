//! Metric names emitted by the datamanager.

/// Committed WAL entries.
pub const WAL_WRITES_TOTAL: &str = "capstan_wal_writes_total";

/// WAL writes that failed with a conflict.
pub const WAL_CONFLICTS_TOTAL: &str = "capstan_wal_conflicts_total";

/// Completed checkpoints.
pub const CHECKPOINTS_TOTAL: &str = "capstan_checkpoints_total";

/// WAL entries removed by garbage collection.
pub const WAL_GC_ENTRIES_TOTAL: &str = "capstan_wal_gc_entries_total";
