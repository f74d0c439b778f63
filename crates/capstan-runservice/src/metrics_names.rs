//! Metric names emitted by the run engine.

/// Engine tick executions.
pub const ENGINE_TICKS_TOTAL: &str = "capstan_engine_ticks_total";

/// Tasks dispatched to executors.
pub const DISPATCHES_TOTAL: &str = "capstan_dispatches_total";

/// Runs reaching the finished phase.
pub const RUNS_FINISHED_TOTAL: &str = "capstan_runs_finished_total";

/// Terminal runs removed by the expiry collector.
pub const RUNS_EXPIRED_TOTAL: &str = "capstan_runs_expired_total";
