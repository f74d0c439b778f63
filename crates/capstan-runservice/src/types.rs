//! Run, run config and run task types.
//!
//! A run is the scheduled execution of a task DAG. The run config is
//! the immutable plan (tasks, dependencies, runtimes, steps); the run
//! carries the mutable per-task state. Both share the same task key
//! set for their whole lifetime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use capstan_core::{ExecutorId, ProjectId, RunId, TaskId};

/// Run lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Created, nothing dispatched yet.
    Queued,
    /// At least one task was dispatched.
    Running,
    /// Every task reached a terminal status. No transitions out.
    Finished,
    /// Stop requested, cleanup in progress; becomes `Finished` once
    /// every task is terminal.
    Cancelled,
}

impl RunPhase {
    /// Returns true for the terminal phase.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// Run outcome, computed at finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    /// Not yet finalized.
    Unknown,
    /// Every task succeeded or was skipped.
    Success,
    /// A task failed without `ignore_failure`.
    Failed,
    /// A task was stopped and none failed.
    Stopped,
}

/// Task state machine states.
///
/// States have a rank for monotonic ordering; the engine never moves a
/// task to a lower-ranked state. The one exception is the out-of-band
/// approval action, which returns an approved `WaitingApproval` task
/// to `NotStarted` so eligibility only ever sees `NotStarted` tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTaskStatus {
    /// Waiting for dependencies or dispatch.
    NotStarted,
    /// Gated on an approval.
    WaitingApproval,
    /// Dispatched to an executor.
    Running,
    /// Never executed: skipped directly or through its dependencies.
    Skipped,
    /// Stopped before or during execution.
    Stopped,
    /// Execution failed.
    Failed,
    /// Execution succeeded.
    Success,
}

impl RunTaskStatus {
    /// Returns the state rank; higher rank = more terminal.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::WaitingApproval => 1,
            Self::Running => 2,
            Self::Skipped => 10,
            Self::Stopped => 11,
            Self::Failed => 12,
            Self::Success => 13,
        }
    }

    /// Returns true for terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::Stopped | Self::Failed | Self::Success
        )
    }
}

/// Phase of a single step (setup or user step).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Not reached yet.
    NotStarted,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Success,
    /// Completed with a failure.
    Failed,
    /// Never executed because an earlier step failed.
    Skipped,
}

impl StepPhase {
    /// Returns true for terminal phases.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

/// Runtime state of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTaskStep {
    /// Current phase.
    pub phase: StepPhase,
    /// True once the step's log landed in the object store.
    #[serde(default)]
    pub log_archived: bool,
    /// Process exit status, for terminal run steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    /// When the step started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the step ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Default for RunTaskStep {
    fn default() -> Self {
        Self {
            phase: StepPhase::NotStarted,
            log_archived: false,
            exit_status: None,
            start_time: None,
            end_time: None,
        }
    }
}

/// Runtime state of one task in the DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTask {
    /// Task key, identical to the run config key.
    pub id: TaskId,
    /// Current status.
    pub status: RunTaskStatus,
    /// True once the approval gate was passed.
    #[serde(default)]
    pub approved: bool,
    /// The setup step (workspace preparation, runtime start).
    #[serde(default)]
    pub setup_step: RunTaskStep,
    /// User steps, in declared order.
    #[serde(default)]
    pub steps: Vec<RunTaskStep>,
    /// Executor the task was assigned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,
    /// When the task started executing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl RunTask {
    /// Creates the initial state for a task.
    #[must_use]
    pub fn new(id: TaskId, status: RunTaskStatus) -> Self {
        Self {
            id,
            status,
            approved: false,
            setup_step: RunTaskStep::default(),
            steps: Vec::new(),
            executor_id: None,
            start_time: None,
            end_time: None,
        }
    }
}

/// A scheduled execution of a task DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique id.
    pub id: RunId,
    /// Human-readable name from the run definition.
    pub name: String,
    /// Owning project.
    pub project_id: ProjectId,
    /// Project path, used for run listing filters.
    pub group: String,
    /// Lifecycle phase.
    pub phase: RunPhase,
    /// Outcome, `Unknown` until finalized.
    pub result: RunResult,
    /// Stop intent; recorded asynchronously, acted on by the engine.
    #[serde(default)]
    pub stop: bool,
    /// Trigger metadata (branch, ref, commit sha, sender, ...).
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Per-task runtime state, keyed like the run config tasks.
    pub tasks: BTreeMap<TaskId, RunTask>,
    /// When the run was created.
    pub enqueue_time: Option<DateTime<Utc>>,
    /// When the first task was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Dependency condition: which terminal status of the dependency
/// allows the dependent to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependCondition {
    /// Proceed when the dependency succeeded.
    OnSuccess,
    /// Proceed when the dependency failed.
    OnFailure,
    /// Proceed when the dependency was skipped.
    OnSkipped,
}

impl DependCondition {
    /// Returns true if a dependency in `status` satisfies this
    /// condition.
    #[must_use]
    pub const fn satisfied_by(self, status: RunTaskStatus) -> bool {
        matches!(
            (self, status),
            (Self::OnSuccess, RunTaskStatus::Success)
                | (Self::OnFailure, RunTaskStatus::Failed)
                | (Self::OnSkipped, RunTaskStatus::Skipped)
        )
    }
}

/// One dependency edge of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfigTaskDepend {
    /// The dependency's task key.
    pub task_id: TaskId,
    /// Conditions under which the edge is satisfied; empty means
    /// `on_success`.
    #[serde(default)]
    pub conditions: Vec<DependCondition>,
}

impl RunConfigTaskDepend {
    /// Returns true if a dependency in `status` satisfies this edge.
    #[must_use]
    pub fn satisfied_by(&self, status: RunTaskStatus) -> bool {
        if self.conditions.is_empty() {
            return DependCondition::OnSuccess.satisfied_by(status);
        }
        self.conditions.iter().any(|c| c.satisfied_by(status))
    }
}

/// Container image spec inside a runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Image reference.
    pub image: String,
    /// Container-level environment.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
}

/// Task runtime: the pod the task runs in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
    /// Runtime kind (currently always `pod`).
    #[serde(rename = "type")]
    pub runtime_type: String,
    /// Containers; the first one runs the steps.
    pub containers: Vec<Container>,
}

impl Runtime {
    /// Creates a single-container pod runtime.
    #[must_use]
    pub fn pod(image: impl Into<String>) -> Self {
        Self {
            runtime_type: "pod".to_string(),
            containers: vec![Container {
                image: image.into(),
                environment: HashMap::new(),
            }],
        }
    }
}

/// One step of a task, as a tagged variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Clone the triggering repository into the workspace.
    Clone {},
    /// Run a command.
    Run {
        /// Display name; defaults to the command.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// The command line.
        command: String,
        /// Step-level environment.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        environment: HashMap<String, String>,
    },
    /// Save paths into a named cache.
    SaveCache {
        /// Cache key.
        key: String,
        /// Paths to store.
        contents: Vec<String>,
    },
    /// Restore the first matching cache.
    RestoreCache {
        /// Keys, tried in order.
        keys: Vec<String>,
        /// Destination directory.
        dest_dir: String,
    },
    /// Save paths into the run workspace.
    SaveToWorkspace {
        /// Paths to store.
        contents: Vec<String>,
    },
    /// Restore the run workspace.
    RestoreWorkspace {
        /// Destination directory.
        dest_dir: String,
    },
}

/// The immutable plan for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfigTask {
    /// Task key.
    pub id: TaskId,
    /// Display name.
    pub name: String,
    /// Dependency edges.
    #[serde(default)]
    pub depends: Vec<RunConfigTaskDepend>,
    /// Execution runtime.
    pub runtime: Runtime,
    /// Task environment (resolved variables included).
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Precomputed from the task's `when` clause against the trigger.
    #[serde(default)]
    pub skip: bool,
    /// Gate execution on an explicit approval.
    #[serde(default)]
    pub needs_approval: bool,
    /// A failure of this task does not fail the run.
    #[serde(default)]
    pub ignore_failure: bool,
    /// Labels an executor must carry to receive this task.
    #[serde(default)]
    pub required_labels: HashMap<String, String>,
}

/// The immutable plan of a run. Shares its id with the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Id, equal to the run's id.
    pub id: RunId,
    /// The planned tasks.
    pub tasks: BTreeMap<TaskId, RunConfigTask>,
}

/// A registered executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Executor {
    /// Unique id.
    pub id: ExecutorId,
    /// Capability labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Concurrent task cap.
    pub active_tasks_limit: u32,
    /// Currently executing tasks, reported by heartbeat.
    #[serde(default)]
    pub active_tasks: u32,
    /// Last heartbeat time.
    pub last_heartbeat: DateTime<Utc>,
}

/// A task assignment handed to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorTask {
    /// Assignment id (`<run id>-<task key>`).
    pub id: String,
    /// The run.
    pub run_id: RunId,
    /// The task within the run.
    pub task_id: TaskId,
    /// The chosen executor.
    pub executor_id: ExecutorId,
    /// Stop request flag, set on run cancellation.
    #[serde(default)]
    pub stop: bool,
    /// Pod spec for the task.
    pub runtime: Runtime,
    /// Resolved environment.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Steps to execute.
    pub steps: Vec<Step>,
    /// When the assignment was recorded.
    pub dispatched_at: DateTime<Utc>,
}

impl ExecutorTask {
    /// Builds the assignment id for a `(run, task)` pair.
    #[must_use]
    pub fn assignment_id(run_id: RunId, task_id: &TaskId) -> String {
        format!("{run_id}-{task_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ranks_are_monotonic() {
        assert!(RunTaskStatus::NotStarted.rank() < RunTaskStatus::Running.rank());
        assert!(RunTaskStatus::Running.rank() < RunTaskStatus::Skipped.rank());
        for status in [
            RunTaskStatus::Skipped,
            RunTaskStatus::Stopped,
            RunTaskStatus::Failed,
            RunTaskStatus::Success,
        ] {
            assert!(status.is_terminal());
        }
        assert!(!RunTaskStatus::Running.is_terminal());
        assert!(!RunTaskStatus::WaitingApproval.is_terminal());
    }

    #[test]
    fn default_depend_condition_is_on_success() {
        let dep = RunConfigTaskDepend {
            task_id: TaskId::from("t"),
            conditions: vec![],
        };
        assert!(dep.satisfied_by(RunTaskStatus::Success));
        assert!(!dep.satisfied_by(RunTaskStatus::Failed));
        assert!(!dep.satisfied_by(RunTaskStatus::Skipped));
        assert!(!dep.satisfied_by(RunTaskStatus::Stopped));
    }

    #[test]
    fn explicit_depend_conditions() {
        let dep = RunConfigTaskDepend {
            task_id: TaskId::from("t"),
            conditions: vec![DependCondition::OnFailure, DependCondition::OnSkipped],
        };
        assert!(dep.satisfied_by(RunTaskStatus::Failed));
        assert!(dep.satisfied_by(RunTaskStatus::Skipped));
        assert!(!dep.satisfied_by(RunTaskStatus::Success));
    }

    #[test]
    fn step_serializes_with_type_discriminator() {
        let step = Step::Run {
            name: None,
            command: "make test".into(),
            environment: HashMap::new(),
        };
        let json = serde_json::to_value(&step).expect("serialize");
        assert_eq!(json["type"], "run");
        assert_eq!(json["command"], "make test");

        let clone: Step = serde_json::from_value(serde_json::json!({"type": "clone"}))
            .expect("deserialize");
        assert_eq!(clone, Step::Clone {});
    }

    #[test]
    fn run_roundtrips_through_json() {
        let id = RunId::generate();
        let task_id = TaskId::from("task01");
        let run = Run {
            id,
            name: "run01".into(),
            project_id: ProjectId::generate(),
            group: "org/o1/p1".into(),
            phase: RunPhase::Queued,
            result: RunResult::Unknown,
            stop: false,
            annotations: HashMap::from([("branch".to_string(), "master".to_string())]),
            tasks: BTreeMap::from([(
                task_id.clone(),
                RunTask::new(task_id, RunTaskStatus::NotStarted),
            )]),
            enqueue_time: Some(Utc::now()),
            start_time: None,
            end_time: None,
        };
        let json = serde_json::to_string(&run).expect("serialize");
        let back: Run = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(run, back);
    }
}
