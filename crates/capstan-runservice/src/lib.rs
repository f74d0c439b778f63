//! # capstan-runservice
//!
//! The run scheduling core: run generation from triggers, the run DAG
//! engine, executor dispatch and the run service actions.
//!
//! ## Flow
//!
//! ```text
//! trigger → rungen → RunService.create_run → WAL → ReadDB
//!           Engine tick: advance → eligibility → dispatch → finalize
//!           executor → report_task_event → WAL → next tick
//! ```
//!
//! Everything state-changing goes through the datamanager's WAL under
//! the run's changegroup, so any number of engine processes can tick
//! concurrently: exactly one write per run per revision wins, the
//! others re-read on their next tick.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod dag;
pub mod dispatch;
pub mod engine;
pub mod gc;
pub mod metrics_names;
pub mod rungen;
pub mod scheduler;
pub mod service;
pub mod types;

pub use dispatch::{select_executor, ExecutorHandle, ExecutorRegistry};
pub use engine::Engine;
pub use gc::RunCollector;
pub use rungen::{
    generate_run, generate_runs, validate_config, RunDefinition, TaskDefinition, WebhookData,
    WebhookEvent,
};
pub use scheduler::{advance_run_tasks, apply_stop, finalize_run, get_tasks_to_run};
pub use service::{RunFilter, RunService, StepRef, TaskEvent};
pub use types::{
    Container, DependCondition, Executor, ExecutorTask, Run, RunConfig, RunConfigTask,
    RunConfigTaskDepend, RunPhase, RunResult, RunTask, RunTaskStatus, RunTaskStep, Runtime, Step,
    StepPhase,
};
