//! The run engine: periodic per-run ticks.
//!
//! Each tick is idempotent: it reloads the run from the projection,
//! applies stop intents, propagates terminal states, dispatches
//! eligible tasks and finalizes - then commits everything as one WAL
//! entry guarded by the run's changegroup. A conflict just means
//! another engine got there first; the next tick re-reads.

use chrono::Utc;
use metrics::counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capstan_core::{Error, Result, RunId};
use capstan_datamanager::{
    executor_group, id_group, Action, ChangeGroupsUpdateToken, DataManager, DataType, ReadDb,
};

use crate::dispatch::{select_executor, ExecutorRegistry};
use crate::metrics_names;
use crate::scheduler::{advance_run_tasks, apply_stop, finalize_run, get_tasks_to_run};
use crate::types::{
    Executor, ExecutorTask, Run, RunConfig, RunPhase, RunResult, RunTaskStatus,
};

/// The run engine.
#[derive(Clone)]
pub struct Engine {
    dm: Arc<DataManager>,
    readdb: ReadDb,
    registry: ExecutorRegistry,
    /// Per-run mutexes preventing double-dispatch inside one process.
    run_locks: Arc<Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Engine {
    /// Creates an engine.
    #[must_use]
    pub fn new(dm: Arc<DataManager>, readdb: ReadDb, registry: ExecutorRegistry) -> Self {
        Self {
            dm,
            readdb,
            registry,
            run_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ticks every non-terminal run, in parallel.
    ///
    /// Individual run failures are logged, not propagated: one broken
    /// run must not stall the others.
    pub async fn tick_all(&self) -> Result<()> {
        let run_ids: Vec<RunId> = self.readdb.do_read(|tx| {
            Ok(tx
                .all_as::<Run>(DataType::Run)?
                .into_iter()
                .filter(|run| !run.phase.is_finished())
                .map(|run| run.id)
                .collect())
        })?;

        let ticks = run_ids.iter().map(|run_id| self.tick_run(*run_id));
        for (run_id, result) in run_ids.iter().zip(futures::future::join_all(ticks).await) {
            if let Err(e) = result {
                if matches!(e, Error::Fatal { .. }) {
                    // Invariant violation: fail the run, keep going.
                    tracing::error!(run_id = %run_id, error = %e, "fatal run error");
                    if let Err(fail_err) = self.fail_run(*run_id).await {
                        tracing::error!(run_id = %run_id, error = %fail_err, "failed to mark run failed");
                    }
                } else {
                    tracing::warn!(run_id = %run_id, error = %e, "run tick failed");
                }
            }
        }
        Ok(())
    }

    /// Ticks one run.
    ///
    /// # Errors
    ///
    /// Returns `Fatal` on invariant violations; infrastructure errors
    /// otherwise. Conflicts are swallowed (the next tick retries).
    #[tracing::instrument(skip(self), fields(run_id = %run_id))]
    pub async fn tick_run(&self, run_id: RunId) -> Result<()> {
        let lock = self.run_lock(run_id)?;
        let _guard = lock.lock().await;
        counter!(metrics_names::ENGINE_TICKS_TOTAL).increment(1);

        let Some((mut run, rc, mut cgt)) = self.load_run(run_id)? else {
            return Ok(());
        };
        if run.phase.is_finished() {
            self.drop_run_lock(run_id)?;
            return Ok(());
        }
        let before = run.clone();
        let mut extra_actions: Vec<Action> = Vec::new();

        if run.stop {
            apply_stop(&mut run);
            extra_actions.extend(self.stop_executor_tasks(run_id)?);
        }

        advance_run_tasks(&mut run, &rc)?;

        if !run.stop {
            let eligible = get_tasks_to_run(&mut run, &rc)?;
            if !eligible.is_empty() {
                let dispatch_actions = self.dispatch(&mut run, &rc, &eligible, &mut cgt).await?;
                extra_actions.extend(dispatch_actions);
            }
        }

        finalize_run(&mut run, &rc)?;
        if run.phase.is_finished() {
            counter!(metrics_names::RUNS_FINISHED_TOTAL).increment(1);
            tracing::info!(result = ?run.result, "run finished");
        }

        if run == before && extra_actions.is_empty() {
            return Ok(());
        }

        let mut actions = vec![Action::put(DataType::Run, run.id.to_string(), &run)?];
        actions.extend(extra_actions);
        match self.dm.write_wal(actions, Some(&cgt)).await {
            Ok(seq) => {
                self.readdb.wait_for_seq(seq).await?;
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                // Someone else advanced the run; the next tick sees
                // their state.
                tracing::debug!("tick lost its changegroup race");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Dispatches eligible tasks onto executors.
    ///
    /// Each assignment marks the task `running` with its executor and
    /// creates the `ExecutorTask` record; the write is guarded by the
    /// chosen executors' changegroups so a concurrent capacity change
    /// voids the decision. Tasks with no eligible executor stay
    /// `not_started` for the next tick.
    async fn dispatch(
        &self,
        run: &mut Run,
        rc: &RunConfig,
        eligible: &[capstan_core::TaskId],
        cgt: &mut ChangeGroupsUpdateToken,
    ) -> Result<Vec<Action>> {
        let mut executors = self.registry.list().await?;
        let stale_after = self.registry.stale_after();
        let mut actions = Vec::new();
        let mut used_groups = Vec::new();

        for task_id in eligible {
            let rct = rc
                .tasks
                .get(task_id)
                .ok_or_else(|| Error::fatal(format!("no config for task {task_id}")))?;

            let Some(chosen) =
                select_executor(&executors, &rct.required_labels, stale_after).map(Executor::clone)
            else {
                tracing::debug!(task_id = %task_id, "no executor available, task stays queued");
                continue;
            };

            let task = run
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::fatal(format!("run has no task {task_id}")))?;
            task.status = RunTaskStatus::Running;
            task.executor_id = Some(chosen.id);
            task.start_time = Some(Utc::now());

            let assignment = ExecutorTask {
                id: ExecutorTask::assignment_id(run.id, task_id),
                run_id: run.id,
                task_id: task_id.clone(),
                executor_id: chosen.id,
                stop: false,
                runtime: rct.runtime.clone(),
                environment: rct.environment.clone(),
                steps: rct.steps.clone(),
                dispatched_at: Utc::now(),
            };
            actions.push(Action::put(
                DataType::ExecutorTask,
                assignment.id.clone(),
                &assignment,
            )?);
            used_groups.push(executor_group(&chosen.id.to_string()));

            // Account locally so one tick doesn't overfill an executor.
            if let Some(live) = executors.iter_mut().find(|e| e.id == chosen.id) {
                live.active_tasks += 1;
            }

            if run.phase == RunPhase::Queued {
                run.phase = RunPhase::Running;
                run.start_time = Some(Utc::now());
            }
            counter!(metrics_names::DISPATCHES_TOTAL).increment(1);
            tracing::info!(task_id = %task_id, executor = %chosen.id, "task dispatched");
        }

        if !used_groups.is_empty() {
            let token = self
                .readdb
                .do_read(|tx| Ok(tx.change_group_tokens(&used_groups)))?;
            cgt.merge(token);
        }
        Ok(actions)
    }

    /// Builds stop updates for a run's open executor assignments.
    fn stop_executor_tasks(&self, run_id: RunId) -> Result<Vec<Action>> {
        self.readdb.do_read(|tx| {
            let mut actions = Vec::new();
            for mut assignment in tx
                .all_as::<ExecutorTask>(DataType::ExecutorTask)?
                .into_iter()
                .filter(|et| et.run_id == run_id && !et.stop)
            {
                assignment.stop = true;
                actions.push(Action::put(
                    DataType::ExecutorTask,
                    assignment.id.clone(),
                    &assignment,
                )?);
            }
            Ok(actions)
        })
    }

    /// Marks a run failed after a fatal invariant violation.
    async fn fail_run(&self, run_id: RunId) -> Result<()> {
        let Some((mut run, _, cgt)) = self.load_run(run_id)? else {
            return Ok(());
        };
        if run.phase.is_finished() {
            return Ok(());
        }
        for task in run.tasks.values_mut() {
            if !task.status.is_terminal() {
                task.status = RunTaskStatus::Failed;
                task.end_time = Some(Utc::now());
            }
        }
        run.phase = RunPhase::Finished;
        run.result = RunResult::Failed;
        run.end_time = Some(Utc::now());

        let actions = vec![Action::put(DataType::Run, run.id.to_string(), &run)?];
        match self.dm.write_wal(actions, Some(&cgt)).await {
            Ok(_) | Err(Error::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn load_run(&self, run_id: RunId) -> Result<Option<(Run, RunConfig, ChangeGroupsUpdateToken)>> {
        self.readdb.do_read(|tx| {
            let Some(run) = tx.get_as::<Run>(DataType::Run, &run_id.to_string())? else {
                return Ok(None);
            };
            let rc = tx
                .get_as::<RunConfig>(DataType::RunConfig, &run_id.to_string())?
                .ok_or_else(|| Error::fatal(format!("run {run_id} has no runconfig")))?;
            let token = tx.change_group_tokens(&[id_group(DataType::Run, &run_id.to_string())]);
            Ok(Some((run, rc, token)))
        })
    }

    fn run_lock(&self, run_id: RunId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .run_locks
            .lock()
            .map_err(|_| Error::internal("run lock table poisoned"))?;
        Ok(locks.entry(run_id).or_default().clone())
    }

    fn drop_run_lock(&self, run_id: RunId) -> Result<()> {
        let mut locks = self
            .run_locks
            .lock()
            .map_err(|_| Error::internal("run lock table poisoned"))?;
        locks.remove(&run_id);
        Ok(())
    }

    /// Runs the periodic tick loop until `shutdown` flips.
    pub async fn run_loop(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick_all().await {
                        tracing::error!(error = %e, "engine tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("engine loop stopping");
                        return;
                    }
                }
            }
        }
    }
}
