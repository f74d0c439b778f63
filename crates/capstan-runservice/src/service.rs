//! Run service actions.
//!
//! The operations the gateway and the executors call: run
//! creation/approval/stop/lookup, executor task event reporting with
//! monotonic step sequencing, and log/artifact storage. Every mutation
//! follows the capture-tokens-then-write-WAL discipline; conflicts are
//! retried a few times before surfacing.

use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use capstan_core::storage::StorageBackend;
use capstan_core::{paths, Error, ExecutorId, Result, RunId, TaskId};
use capstan_datamanager::{id_group, Action, ChangeGroupsUpdateToken, DataManager, DataType, ReadDb};

use crate::rungen::validate_config;
use crate::types::{
    ExecutorTask, Run, RunConfig, RunPhase, RunResult, RunTask, RunTaskStatus, StepPhase,
};

/// Conflict retries before an update surfaces `Conflict`.
const MAX_UPDATE_RETRIES: u32 = 5;

/// Default page size for run listings.
const DEFAULT_RUNS_LIMIT: usize = 25;

/// Which step of a task an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRef {
    /// The setup step.
    Setup,
    /// A user step by zero-based index.
    Step(usize),
}

impl StepRef {
    /// The step's path component in the log layout.
    #[must_use]
    pub fn path_component(&self) -> String {
        match self {
            Self::Setup => "setup".to_string(),
            Self::Step(index) => index.to_string(),
        }
    }
}

/// A task state event reported by an executor.
#[derive(Debug, Clone, Copy)]
pub struct TaskEvent {
    /// The step the event refers to.
    pub target: StepRef,
    /// The step's new phase.
    pub phase: StepPhase,
    /// Exit status for terminal run-step phases.
    pub exit_status: Option<i32>,
}

/// Filter for run listings.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Restrict to runs whose group is at or below one of these paths.
    pub groups: Vec<String>,
    /// Restrict by phase.
    pub phase: Option<RunPhase>,
    /// Restrict by result.
    pub result: Option<RunResult>,
    /// Exclusive pagination cursor.
    pub start_run: Option<RunId>,
    /// Page size; 0 means the default.
    pub limit: usize,
    /// Ascending id order instead of newest-first.
    pub asc: bool,
}

/// The run service.
#[derive(Clone)]
pub struct RunService {
    dm: Arc<DataManager>,
    readdb: ReadDb,
    storage: Arc<dyn StorageBackend>,
}

impl RunService {
    /// Creates the run service.
    #[must_use]
    pub fn new(dm: Arc<DataManager>, readdb: ReadDb, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            dm,
            readdb,
            storage,
        }
    }

    // ------------------------------------------------------------------
    // Submission API
    // ------------------------------------------------------------------

    /// Persists a generated `(run, runconfig)` pair.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if the pair violates the shape invariants
    /// (diverging task sets, unknown dependencies, cycles).
    #[tracing::instrument(skip(self, run, rc), fields(run_id = %run.id))]
    pub async fn create_run(&self, run: Run, rc: RunConfig) -> Result<RunId> {
        if run.id != rc.id {
            return Err(Error::bad_request("run and runconfig ids differ"));
        }
        let run_keys: Vec<&TaskId> = run.tasks.keys().collect();
        let config_keys: Vec<&TaskId> = rc.tasks.keys().collect();
        if run_keys != config_keys {
            return Err(Error::bad_request(
                "run and runconfig task sets are not equal",
            ));
        }
        validate_config(&rc)?;

        let run_id = run.id;
        let seq = self
            .dm
            .write_wal(
                vec![
                    Action::put(DataType::RunConfig, rc.id.to_string(), &rc)?,
                    Action::put(DataType::Run, run.id.to_string(), &run)?,
                ],
                None,
            )
            .await?;
        self.readdb.wait_for_seq(seq).await?;
        tracing::info!(%run_id, "run created");
        Ok(run_id)
    }

    /// Returns a run with its config.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown run.
    pub fn get_run(&self, run_id: RunId) -> Result<(Run, RunConfig)> {
        self.readdb.do_read(|tx| {
            let run = tx
                .get_as::<Run>(DataType::Run, &run_id.to_string())?
                .ok_or_else(|| Error::not_found("run", run_id))?;
            let rc = tx
                .get_as::<RunConfig>(DataType::RunConfig, &run_id.to_string())?
                .ok_or_else(|| Error::not_found("runconfig", run_id))?;
            Ok((run, rc))
        })
    }

    /// Lists runs matching a filter, paginated by run id.
    ///
    /// # Errors
    ///
    /// Returns an error if stored runs fail to deserialize.
    pub fn get_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let limit = if filter.limit == 0 {
            DEFAULT_RUNS_LIMIT
        } else {
            filter.limit
        };

        self.readdb.do_read(|tx| {
            let mut runs: Vec<Run> = tx
                .all_as::<Run>(DataType::Run)?
                .into_iter()
                .filter(|run| {
                    (filter.groups.is_empty()
                        || filter
                            .groups
                            .iter()
                            .any(|g| capstan_configstore::is_ancestor_path(g, &run.group)))
                        && filter.phase.is_none_or(|phase| run.phase == phase)
                        && filter.result.is_none_or(|result| run.result == result)
                        && filter.start_run.is_none_or(|cursor| {
                            if filter.asc {
                                run.id > cursor
                            } else {
                                run.id < cursor
                            }
                        })
                })
                .collect();

            if filter.asc {
                runs.sort_by_key(|run| run.id);
            } else {
                runs.sort_by_key(|run| std::cmp::Reverse(run.id));
            }
            runs.truncate(limit);
            Ok(runs)
        })
    }

    /// Records an approval for a gated task.
    ///
    /// The approval returns a `waiting_approval` task to `not_started`
    /// with `approved` set, so the next engine tick dispatches it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown runs/tasks and `BadRequest` for
    /// tasks already past the gate.
    pub async fn approve_task(&self, run_id: RunId, task_id: &TaskId) -> Result<()> {
        self.update_run(run_id, |run, _| {
            let task = run_task_mut(run, task_id)?;
            if task.status.is_terminal() || task.status == RunTaskStatus::Running {
                return Err(Error::bad_request(format!(
                    "task {task_id} can no longer be approved"
                )));
            }
            task.approved = true;
            if task.status == RunTaskStatus::WaitingApproval {
                task.status = RunTaskStatus::NotStarted;
            }
            Ok(Vec::new())
        })
        .await
    }

    /// Records a stop intent for a run.
    ///
    /// Returns once the intent is persisted; the engine stops pending
    /// tasks and signals executors on its next tick.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` for already-finished runs.
    pub async fn stop_run(&self, run_id: RunId) -> Result<()> {
        self.update_run(run_id, |run, _| {
            if run.phase.is_finished() {
                return Err(Error::bad_request("run already finished"));
            }
            run.stop = true;
            Ok(Vec::new())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Executor API
    // ------------------------------------------------------------------

    /// Returns the open assignments for an executor (polled dispatch).
    ///
    /// # Errors
    ///
    /// Returns an error if stored assignments fail to deserialize.
    pub fn executor_tasks(&self, executor_id: ExecutorId) -> Result<Vec<ExecutorTask>> {
        self.readdb.do_read(|tx| {
            Ok(tx
                .all_as::<ExecutorTask>(DataType::ExecutorTask)?
                .into_iter()
                .filter(|et| et.executor_id == executor_id)
                .collect())
        })
    }

    /// Applies a task state event reported by an executor.
    ///
    /// Steps complete in declared order; an event for a step whose
    /// predecessors aren't terminal, or one that would move a step
    /// backwards, is rejected. A terminal task event also removes the
    /// executor assignment.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown runs/tasks, `BadRequest` for
    /// out-of-order or regressive events, `Conflict` when retries are
    /// exhausted.
    #[tracing::instrument(skip(self), fields(run_id = %run_id, task_id = %task_id))]
    pub async fn report_task_event(
        &self,
        run_id: RunId,
        task_id: &TaskId,
        event: TaskEvent,
    ) -> Result<()> {
        self.update_run(run_id, |run, _| {
            let stopping = run.stop;
            let task = run_task_mut(run, task_id)?;
            apply_task_event(task, event, stopping)?;

            if task.status.is_terminal() {
                Ok(vec![Action::delete(
                    DataType::ExecutorTask,
                    ExecutorTask::assignment_id(run_id, task_id),
                )])
            } else {
                Ok(Vec::new())
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // Logs and artifacts
    // ------------------------------------------------------------------

    /// Stores a step's log and marks it archived.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown runs/tasks or a step index out of range.
    pub async fn upload_log(
        &self,
        run_id: RunId,
        task_id: &TaskId,
        step: StepRef,
        data: Bytes,
    ) -> Result<()> {
        // Validate the target before writing the blob.
        let (run, _) = self.get_run(run_id)?;
        let task = run_task(&run, task_id)?;
        if let StepRef::Step(index) = step {
            if index >= task.steps.len() {
                return Err(Error::not_found("step", index));
            }
        }

        let path = paths::log_path(
            &run_id.to_string(),
            task_id.as_str(),
            &step.path_component(),
        );
        self.storage
            .put(&path, data, capstan_core::WritePrecondition::None)
            .await?;

        self.update_run(run_id, |run, _| {
            let task = run_task_mut(run, task_id)?;
            step_mut(task, step)?.log_archived = true;
            Ok(Vec::new())
        })
        .await
    }

    /// Fetches a step's log.
    ///
    /// # Errors
    ///
    /// `NotFound` if the log was never archived or already deleted.
    pub async fn get_log(&self, run_id: RunId, task_id: &TaskId, step: StepRef) -> Result<Bytes> {
        let path = paths::log_path(
            &run_id.to_string(),
            task_id.as_str(),
            &step.path_component(),
        );
        self.storage.get(&path).await
    }

    /// Deletes a step's log.
    ///
    /// # Errors
    ///
    /// Returns an error if the object store is unreachable.
    pub async fn delete_log(&self, run_id: RunId, task_id: &TaskId, step: StepRef) -> Result<()> {
        let path = paths::log_path(
            &run_id.to_string(),
            task_id.as_str(),
            &step.path_component(),
        );
        self.storage.delete(&path).await?;

        // The run may already be expired; clearing the flag is
        // best-effort then.
        match self
            .update_run(run_id, |run, _| {
                let task = run_task_mut(run, task_id)?;
                step_mut(task, step)?.log_archived = false;
                Ok(Vec::new())
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Stores a task artifact (workspace archive, cache).
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown runs/tasks.
    pub async fn upload_archive(
        &self,
        run_id: RunId,
        task_id: &TaskId,
        name: &str,
        data: Bytes,
    ) -> Result<()> {
        let (run, _) = self.get_run(run_id)?;
        run_task(&run, task_id)?;

        let path = paths::artifact_path(&run_id.to_string(), task_id.as_str(), name);
        self.storage
            .put(&path, data, capstan_core::WritePrecondition::None)
            .await?;
        Ok(())
    }

    /// Fetches a task artifact.
    ///
    /// # Errors
    ///
    /// `NotFound` if the artifact does not exist.
    pub async fn get_archive(&self, run_id: RunId, task_id: &TaskId, name: &str) -> Result<Bytes> {
        let path = paths::artifact_path(&run_id.to_string(), task_id.as_str(), name);
        self.storage.get(&path).await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Read-modify-write on a run, guarded by its changegroup.
    ///
    /// `mutate` may return extra actions committed atomically with the
    /// run update. Conflicts re-read and retry a bounded number of
    /// times.
    pub(crate) async fn update_run<F>(&self, run_id: RunId, mutate: F) -> Result<()>
    where
        F: Fn(&mut Run, &RunConfig) -> Result<Vec<Action>>,
    {
        for attempt in 0..MAX_UPDATE_RETRIES {
            let (mut run, rc, cgt) = self.read_run_for_update(run_id)?;
            let extra = mutate(&mut run, &rc)?;

            let mut actions = vec![Action::put(DataType::Run, run.id.to_string(), &run)?];
            actions.extend(extra);

            match self.dm.write_wal(actions, Some(&cgt)).await {
                Ok(seq) => {
                    self.readdb.wait_for_seq(seq).await?;
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt + 1 < MAX_UPDATE_RETRIES => {
                    let head = self.dm.head_seq().await?;
                    self.readdb.wait_for_seq(head).await?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(format!(
            "run {run_id} update contention persisted"
        )))
    }

    fn read_run_for_update(
        &self,
        run_id: RunId,
    ) -> Result<(Run, RunConfig, ChangeGroupsUpdateToken)> {
        self.readdb.do_read(|tx| {
            let run = tx
                .get_as::<Run>(DataType::Run, &run_id.to_string())?
                .ok_or_else(|| Error::not_found("run", run_id))?;
            let rc = tx
                .get_as::<RunConfig>(DataType::RunConfig, &run_id.to_string())?
                .ok_or_else(|| Error::not_found("runconfig", run_id))?;
            let token = tx.change_group_tokens(&[id_group(DataType::Run, &run_id.to_string())]);
            Ok((run, rc, token))
        })
    }
}

fn run_task<'a>(run: &'a Run, task_id: &TaskId) -> Result<&'a RunTask> {
    run.tasks
        .get(task_id)
        .ok_or_else(|| Error::not_found("task", task_id))
}

fn run_task_mut<'a>(run: &'a mut Run, task_id: &TaskId) -> Result<&'a mut RunTask> {
    run.tasks
        .get_mut(task_id)
        .ok_or_else(|| Error::not_found("task", task_id))
}

fn step_mut(task: &mut RunTask, step: StepRef) -> Result<&mut crate::types::RunTaskStep> {
    match step {
        StepRef::Setup => Ok(&mut task.setup_step),
        StepRef::Step(index) => task
            .steps
            .get_mut(index)
            .ok_or_else(|| Error::not_found("step", index)),
    }
}

/// Applies one executor event to a task, enforcing step ordering.
fn apply_task_event(task: &mut RunTask, event: TaskEvent, stopping: bool) -> Result<()> {
    if task.status != RunTaskStatus::Running {
        return Err(Error::bad_request(format!(
            "task {} is not running",
            task.id
        )));
    }

    match event.target {
        StepRef::Setup => {}
        StepRef::Step(index) => {
            if index >= task.steps.len() {
                return Err(Error::not_found("step", index));
            }
            if task.setup_step.phase != StepPhase::Success {
                return Err(Error::bad_request("step event before setup completion"));
            }
            // Steps complete in declared order: everything before this
            // step must already be terminal.
            if task.steps[..index].iter().any(|s| !s.phase.is_terminal()) {
                return Err(Error::bad_request(format!(
                    "out-of-order event for step {index}"
                )));
            }
        }
    }

    let task_id = task.id.clone();
    let step = match event.target {
        StepRef::Setup => &mut task.setup_step,
        StepRef::Step(index) => &mut task.steps[index],
    };

    let valid = matches!(
        (step.phase, event.phase),
        (StepPhase::NotStarted, StepPhase::Running)
            | (StepPhase::NotStarted | StepPhase::Running, StepPhase::Success)
            | (StepPhase::NotStarted | StepPhase::Running, StepPhase::Failed)
    );
    if !valid {
        return Err(Error::bad_request(format!(
            "invalid step transition {:?} -> {:?} on task {task_id}",
            step.phase, event.phase
        )));
    }

    let now = Utc::now();
    match event.phase {
        StepPhase::Running => step.start_time = Some(now),
        _ => {
            step.end_time = Some(now);
            step.exit_status = event.exit_status;
        }
    }
    step.phase = event.phase;

    match event.phase {
        StepPhase::Failed => {
            // Remaining steps never execute.
            for pending in task.steps.iter_mut().filter(|s| !s.phase.is_terminal()) {
                pending.phase = StepPhase::Skipped;
            }
            task.status = if stopping {
                RunTaskStatus::Stopped
            } else {
                RunTaskStatus::Failed
            };
            task.end_time = Some(now);
        }
        StepPhase::Success => {
            let all_done = task.setup_step.phase == StepPhase::Success
                && task.steps.iter().all(|s| s.phase.is_terminal());
            if all_done {
                task.status = if stopping && task.steps.iter().any(|s| s.phase == StepPhase::Skipped)
                {
                    RunTaskStatus::Stopped
                } else {
                    RunTaskStatus::Success
                };
                task.end_time = Some(now);
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunTaskStep;

    fn running_task(steps: usize) -> RunTask {
        let mut task = RunTask::new(TaskId::from("task01"), RunTaskStatus::Running);
        task.steps = vec![RunTaskStep::default(); steps];
        task
    }

    fn event(target: StepRef, phase: StepPhase) -> TaskEvent {
        TaskEvent {
            target,
            phase,
            exit_status: None,
        }
    }

    #[test]
    fn setup_then_steps_in_order() {
        let mut task = running_task(2);

        apply_task_event(&mut task, event(StepRef::Setup, StepPhase::Running), false).expect("ok");
        apply_task_event(&mut task, event(StepRef::Setup, StepPhase::Success), false).expect("ok");
        apply_task_event(&mut task, event(StepRef::Step(0), StepPhase::Running), false)
            .expect("ok");
        apply_task_event(&mut task, event(StepRef::Step(0), StepPhase::Success), false)
            .expect("ok");
        apply_task_event(&mut task, event(StepRef::Step(1), StepPhase::Running), false)
            .expect("ok");
        apply_task_event(&mut task, event(StepRef::Step(1), StepPhase::Success), false)
            .expect("ok");

        assert_eq!(task.status, RunTaskStatus::Success);
        assert!(task.end_time.is_some());
    }

    #[test]
    fn step_before_setup_is_rejected() {
        let mut task = running_task(1);
        let err = apply_task_event(&mut task, event(StepRef::Step(0), StepPhase::Running), false)
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[test]
    fn out_of_order_step_is_rejected() {
        let mut task = running_task(2);
        apply_task_event(&mut task, event(StepRef::Setup, StepPhase::Success), false).expect("ok");

        // Step 1 cannot start while step 0 is not terminal.
        let err = apply_task_event(&mut task, event(StepRef::Step(1), StepPhase::Running), false)
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[test]
    fn regressive_phase_is_rejected() {
        let mut task = running_task(1);
        apply_task_event(&mut task, event(StepRef::Setup, StepPhase::Success), false).expect("ok");

        let err = apply_task_event(&mut task, event(StepRef::Setup, StepPhase::Running), false)
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[test]
    fn step_failure_fails_task_and_skips_rest() {
        let mut task = running_task(3);
        apply_task_event(&mut task, event(StepRef::Setup, StepPhase::Success), false).expect("ok");
        apply_task_event(&mut task, event(StepRef::Step(0), StepPhase::Running), false)
            .expect("ok");
        apply_task_event(
            &mut task,
            TaskEvent {
                target: StepRef::Step(0),
                phase: StepPhase::Failed,
                exit_status: Some(1),
            },
            false,
        )
        .expect("ok");

        assert_eq!(task.status, RunTaskStatus::Failed);
        assert_eq!(task.steps[0].exit_status, Some(1));
        assert_eq!(task.steps[1].phase, StepPhase::Skipped);
        assert_eq!(task.steps[2].phase, StepPhase::Skipped);
    }

    #[test]
    fn failure_while_stopping_records_stopped() {
        let mut task = running_task(1);
        apply_task_event(&mut task, event(StepRef::Setup, StepPhase::Success), true).expect("ok");
        apply_task_event(&mut task, event(StepRef::Step(0), StepPhase::Failed), true).expect("ok");
        assert_eq!(task.status, RunTaskStatus::Stopped);
    }

    #[test]
    fn events_on_nonrunning_tasks_are_rejected() {
        let mut task = RunTask::new(TaskId::from("t"), RunTaskStatus::NotStarted);
        let err = apply_task_event(&mut task, event(StepRef::Setup, StepPhase::Running), false)
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }
}
