//! Run generation from trigger events.
//!
//! Takes already-parsed run definitions plus the webhook (or direct
//! run) trigger and produces `(Run, RunConfig)` pairs: `when` clauses
//! are evaluated here to precompute per-task skip flags, annotations
//! are materialized, and the shape invariants (task set closure,
//! acyclicity) are enforced before anything is persisted.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};

use capstan_configstore::{When, WhenContext};
use capstan_core::{Error, ProjectId, Result, RunId, TaskId};

use crate::dag::Dag;
use crate::scheduler::run_dag;
use crate::types::{
    Run, RunConfig, RunConfigTask, RunConfigTaskDepend, RunPhase, RunResult, RunTask,
    RunTaskStatus, Runtime, Step,
};

/// Commit messages containing this marker anywhere produce no runs.
const CI_SKIP_MARKER: &str = "[ci skip]";

/// The kind of event that triggered run generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    /// A branch push.
    Push,
    /// A tag push.
    TagPush,
    /// A pull request event. Every PR event produces a run attempt;
    /// per-task `when` clauses do any further filtering.
    PullRequest,
}

/// Parsed trigger data handed over by the gateway.
#[derive(Debug, Clone)]
pub struct WebhookData {
    /// Trigger kind.
    pub event: WebhookEvent,
    /// Owning project.
    pub project_id: ProjectId,
    /// Project path (used as the run group).
    pub project_path: String,
    /// Branch, for pushes and PRs.
    pub branch: Option<String>,
    /// Tag, for tag pushes.
    pub tag: Option<String>,
    /// Full git ref.
    pub reference: String,
    /// PR number, for PR events.
    pub pull_request_id: Option<String>,
    /// Head commit sha.
    pub commit_sha: String,
    /// Head commit message (subject and body).
    pub message: String,
    /// Trigger author.
    pub sender: String,
}

impl WebhookData {
    /// The `when` evaluation context for this trigger.
    #[must_use]
    pub fn when_context(&self) -> WhenContext<'_> {
        WhenContext {
            branch: self.branch.as_deref(),
            tag: self.tag.as_deref(),
            reference: Some(&self.reference),
        }
    }

    fn ref_type(&self) -> &'static str {
        match self.event {
            WebhookEvent::Push => "branch",
            WebhookEvent::TagPush => "tag",
            WebhookEvent::PullRequest => "pull_request",
        }
    }
}

/// One task of a run definition, before `when` evaluation.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    /// Task name; doubles as the task key.
    pub name: String,
    /// Dependencies by task name.
    pub depends: Vec<RunConfigTaskDepend>,
    /// Execution runtime.
    pub runtime: Runtime,
    /// Static task environment.
    pub environment: HashMap<String, String>,
    /// Ordered steps.
    pub steps: Vec<Step>,
    /// Skip predicate; an unmatched `when` skips the task.
    pub when: Option<When>,
    /// Gate execution on an explicit approval.
    pub needs_approval: bool,
    /// A failure of this task does not fail the run.
    pub ignore_failure: bool,
    /// Labels an executor must carry.
    pub required_labels: HashMap<String, String>,
}

/// A parsed run definition (one `run:` entry of a pipeline file).
#[derive(Debug, Clone)]
pub struct RunDefinition {
    /// Run name.
    pub name: String,
    /// Tasks, in declaration order.
    pub tasks: Vec<TaskDefinition>,
    /// Run-level predicate; an unmatched `when` drops the whole run.
    pub when: Option<When>,
}

/// Builds the annotations for a trigger.
#[must_use]
pub fn webhook_annotations(data: &WebhookData) -> HashMap<String, String> {
    let mut annotations = HashMap::from([
        ("ref".to_string(), data.reference.clone()),
        ("ref_type".to_string(), data.ref_type().to_string()),
        ("commit_sha".to_string(), data.commit_sha.clone()),
        ("message".to_string(), data.message.clone()),
        ("sender".to_string(), data.sender.clone()),
        ("project_path".to_string(), data.project_path.clone()),
    ]);
    if let Some(branch) = &data.branch {
        annotations.insert("branch".to_string(), branch.clone());
    }
    if let Some(tag) = &data.tag {
        annotations.insert("tag".to_string(), tag.clone());
    }
    if let Some(pr) = &data.pull_request_id {
        annotations.insert("pull_request_id".to_string(), pr.clone());
    }
    annotations
}

/// Generates `(Run, RunConfig)` pairs for a trigger.
///
/// A commit message carrying `[ci skip]` anywhere (subject or body)
/// generates nothing at all; run-level `when` clauses drop individual
/// definitions; task-level `when` clauses precompute skip flags.
///
/// # Errors
///
/// Returns `BadRequest` for definitions with unknown dependency names,
/// cyclic dependencies or an invalid `when` pattern.
pub fn generate_runs(
    data: &WebhookData,
    definitions: &[RunDefinition],
) -> Result<Vec<(Run, RunConfig)>> {
    if data.message.contains(CI_SKIP_MARKER) {
        tracing::debug!(project = %data.project_path, "commit requests ci skip, no runs generated");
        return Ok(Vec::new());
    }

    let ctx = data.when_context();
    let mut out = Vec::new();
    for definition in definitions {
        if let Some(when) = &definition.when {
            if !when.matches(&ctx)? {
                continue;
            }
        }
        out.push(generate_run(data, definition)?);
    }
    Ok(out)
}

/// Generates one `(Run, RunConfig)` pair from a matched definition.
///
/// # Errors
///
/// Returns `BadRequest` for unknown dependency names, duplicate task
/// names, cyclic dependencies or an invalid `when` pattern.
pub fn generate_run(data: &WebhookData, definition: &RunDefinition) -> Result<(Run, RunConfig)> {
    let ctx = data.when_context();
    let run_id = RunId::generate();

    let mut tasks = BTreeMap::new();
    for task_def in &definition.tasks {
        let task_id = TaskId::from(task_def.name.as_str());
        let skip = match &task_def.when {
            Some(when) => !when.matches(&ctx)?,
            None => false,
        };
        let config_task = RunConfigTask {
            id: task_id.clone(),
            name: task_def.name.clone(),
            depends: task_def.depends.clone(),
            runtime: task_def.runtime.clone(),
            environment: task_def.environment.clone(),
            steps: task_def.steps.clone(),
            skip,
            needs_approval: task_def.needs_approval,
            ignore_failure: task_def.ignore_failure,
            required_labels: task_def.required_labels.clone(),
        };
        if tasks.insert(task_id, config_task).is_some() {
            return Err(Error::bad_request(format!(
                "duplicate task name {:?} in run {:?}",
                task_def.name, definition.name
            )));
        }
    }

    let rc = RunConfig { id: run_id, tasks };
    validate_config(&rc)?;

    let run_tasks = rc
        .tasks
        .values()
        .map(|task| {
            let status = if task.skip {
                RunTaskStatus::Skipped
            } else {
                RunTaskStatus::NotStarted
            };
            let mut run_task = RunTask::new(task.id.clone(), status);
            run_task.steps = vec![crate::types::RunTaskStep::default(); task.steps.len()];
            (task.id.clone(), run_task)
        })
        .collect();

    let run = Run {
        id: run_id,
        name: definition.name.clone(),
        project_id: data.project_id,
        group: data.project_path.clone(),
        phase: RunPhase::Queued,
        result: RunResult::Unknown,
        stop: false,
        annotations: webhook_annotations(data),
        tasks: run_tasks,
        enqueue_time: Some(Utc::now()),
        start_time: None,
        end_time: None,
    };
    Ok((run, rc))
}

/// Validates a run config's shape: dependency closure and acyclicity.
///
/// # Errors
///
/// Returns `BadRequest` describing the violation.
pub fn validate_config(rc: &RunConfig) -> Result<()> {
    for (task_id, task) in &rc.tasks {
        for dep in &task.depends {
            if !rc.tasks.contains_key(&dep.task_id) {
                return Err(Error::bad_request(format!(
                    "task {task_id} depends on unknown task {}",
                    dep.task_id
                )));
            }
        }
    }
    // Surface cycles as caller errors here: nothing was persisted yet.
    let dag: Dag<TaskId> = run_dag(rc).map_err(|e| Error::bad_request(e.to_string()))?;
    dag.toposort()
        .map_err(|e| Error::bad_request(e.to_string()))?;
    Ok(())
}
