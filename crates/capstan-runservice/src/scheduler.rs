//! The run DAG engine's pure core.
//!
//! Two idempotent, deterministic passes drive every run:
//!
//! - [`advance_run_tasks`] propagates terminal states through the DAG
//!   (skip chains, failed dependency preconditions)
//! - [`get_tasks_to_run`] computes dispatch eligibility, moving
//!   approval-gated tasks to `waiting_approval`
//!
//! Both are pure state closures: no I/O, and two engines starting
//! from the same `(run, runconfig)` land on identical results.

use chrono::Utc;

use capstan_core::{Error, Result, TaskId};

use crate::dag::Dag;
use crate::types::{Run, RunConfig, RunConfigTask, RunPhase, RunResult, RunTaskStatus};

/// Builds the dependency DAG of a run config.
///
/// Nodes are added in key order so traversal order is deterministic.
///
/// # Errors
///
/// Returns `Fatal` if a dependency references an unknown task.
pub fn run_dag(rc: &RunConfig) -> Result<Dag<TaskId>> {
    let mut dag = Dag::new();
    for task_id in rc.tasks.keys() {
        dag.add_node(task_id.clone());
    }
    for (task_id, task) in &rc.tasks {
        for dep in &task.depends {
            if !dag.contains(&dep.task_id) {
                return Err(Error::fatal(format!(
                    "task {task_id} depends on unknown task {}",
                    dep.task_id
                )));
            }
            let from = dag.add_node(dep.task_id.clone());
            let to = dag.add_node(task_id.clone());
            dag.add_edge(from, to);
        }
    }
    Ok(dag)
}

fn config_task<'a>(rc: &'a RunConfig, task_id: &TaskId) -> Result<&'a RunConfigTask> {
    rc.tasks.get(task_id).ok_or_else(|| {
        Error::fatal(format!("run task {task_id} has no run config counterpart"))
    })
}

/// Propagates terminal states through the DAG.
///
/// Walking tasks in topological order: a non-terminal task whose
/// dependencies are all terminal becomes `skipped` when no dependency
/// satisfies its edge conditions - that covers whole-chain skip
/// propagation and dead dependency preconditions alike. Tasks with a
/// satisfied dependency are left alone for eligibility to pick up.
///
/// # Errors
///
/// Returns `Fatal` on a cyclic or non-closed dependency graph.
pub fn advance_run_tasks(run: &mut Run, rc: &RunConfig) -> Result<()> {
    let order = run_dag(rc)?.toposort()?;

    for task_id in order {
        let status = run
            .tasks
            .get(&task_id)
            .ok_or_else(|| Error::fatal(format!("run has no task {task_id}")))?
            .status;
        if status.is_terminal() || status == RunTaskStatus::Running {
            continue;
        }

        let rct = config_task(rc, &task_id)?;
        if rct.depends.is_empty() {
            continue;
        }

        let all_terminal = rct
            .depends
            .iter()
            .all(|dep| run.tasks.get(&dep.task_id).is_some_and(|t| t.status.is_terminal()));
        if !all_terminal {
            continue;
        }

        let any_satisfied = rct.depends.iter().any(|dep| {
            run.tasks
                .get(&dep.task_id)
                .is_some_and(|t| dep.satisfied_by(t.status))
        });
        if !any_satisfied {
            let task = run
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| Error::fatal(format!("run has no task {task_id}")))?;
            task.status = RunTaskStatus::Skipped;
        }
    }
    Ok(())
}

/// Computes the tasks eligible for dispatch.
///
/// A task is returned iff it is `not_started`, not skipped by config,
/// every dependency is terminal with its edge conditions satisfied,
/// and any approval gate has been passed. Tasks hitting an unpassed
/// approval gate are moved to `waiting_approval` instead of returned.
///
/// Returned keys are in task-key order; only set equality matters.
///
/// # Errors
///
/// Returns `Fatal` if the run and config task sets diverge.
pub fn get_tasks_to_run(run: &mut Run, rc: &RunConfig) -> Result<Vec<TaskId>> {
    let mut out = Vec::new();

    let task_ids: Vec<TaskId> = run.tasks.keys().cloned().collect();
    for task_id in task_ids {
        let status = run.tasks[&task_id].status;
        if status != RunTaskStatus::NotStarted {
            continue;
        }

        let rct = config_task(rc, &task_id)?;
        if rct.skip {
            continue;
        }

        let deps_satisfied = rct.depends.iter().all(|dep| {
            run.tasks
                .get(&dep.task_id)
                .is_some_and(|t| t.status.is_terminal() && dep.satisfied_by(t.status))
        });
        if !deps_satisfied {
            continue;
        }

        let task = run
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::fatal(format!("run has no task {task_id}")))?;
        if rct.needs_approval && !task.approved {
            task.status = RunTaskStatus::WaitingApproval;
            continue;
        }

        out.push(task_id);
    }
    Ok(out)
}

/// Applies a recorded stop intent.
///
/// Tasks that never started are stopped outright; running tasks keep
/// going until their executor reports a terminal event. The run moves
/// to `cancelled` until finalization.
pub fn apply_stop(run: &mut Run) {
    if !run.stop || run.phase.is_finished() {
        return;
    }
    if run.phase != RunPhase::Cancelled {
        run.phase = RunPhase::Cancelled;
    }
    for task in run.tasks.values_mut() {
        if matches!(
            task.status,
            RunTaskStatus::NotStarted | RunTaskStatus::WaitingApproval
        ) {
            task.status = RunTaskStatus::Stopped;
            task.end_time = Some(Utc::now());
        }
    }
}

/// Finalizes the run once every task is terminal.
///
/// The result follows `failed > stopped > success` precedence;
/// failures of `ignore_failure` tasks don't count against the run.
///
/// # Errors
///
/// Returns `Fatal` if the run and config task sets diverge.
pub fn finalize_run(run: &mut Run, rc: &RunConfig) -> Result<()> {
    if run.phase.is_finished() {
        return Ok(());
    }
    if !run.tasks.values().all(|t| t.status.is_terminal()) {
        return Ok(());
    }

    let mut result = RunResult::Success;
    for (task_id, task) in &run.tasks {
        match task.status {
            RunTaskStatus::Failed => {
                if !config_task(rc, task_id)?.ignore_failure {
                    result = RunResult::Failed;
                    break;
                }
            }
            RunTaskStatus::Stopped => {
                result = RunResult::Stopped;
            }
            _ => {}
        }
    }

    run.phase = RunPhase::Finished;
    run.result = result;
    run.end_time = Some(Utc::now());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        DependCondition, RunConfigTaskDepend, RunTask, Runtime,
    };
    use capstan_core::{ProjectId, RunId};
    use std::collections::{BTreeMap, HashMap};

    fn config_task_with_deps(id: &str, deps: &[&str]) -> RunConfigTask {
        RunConfigTask {
            id: TaskId::from(id),
            name: id.to_string(),
            depends: deps
                .iter()
                .map(|d| RunConfigTaskDepend {
                    task_id: TaskId::from(*d),
                    conditions: vec![],
                })
                .collect(),
            runtime: Runtime::pod("image01"),
            environment: HashMap::new(),
            steps: vec![],
            skip: false,
            needs_approval: false,
            ignore_failure: false,
            required_labels: HashMap::new(),
        }
    }

    /// The shared five-task config: task02 ← task01; task05 ← task03, task04.
    fn test_config() -> RunConfig {
        let mut tasks = BTreeMap::new();
        for (id, deps) in [
            ("task01", vec![]),
            ("task02", vec!["task01"]),
            ("task03", vec![]),
            ("task04", vec![]),
            ("task05", vec!["task03", "task04"]),
        ] {
            tasks.insert(TaskId::from(id), config_task_with_deps(id, &deps));
        }
        RunConfig {
            id: RunId::generate(),
            tasks,
        }
    }

    fn test_run(rc: &RunConfig) -> Run {
        let tasks = rc
            .tasks
            .keys()
            .map(|id| {
                (
                    id.clone(),
                    RunTask::new(id.clone(), RunTaskStatus::NotStarted),
                )
            })
            .collect();
        Run {
            id: rc.id,
            name: "run01".into(),
            project_id: ProjectId::generate(),
            group: "org/o1/p1".into(),
            phase: RunPhase::Queued,
            result: RunResult::Unknown,
            stop: false,
            annotations: HashMap::new(),
            tasks,
            enqueue_time: Some(Utc::now()),
            start_time: None,
            end_time: None,
        }
    }

    fn set_status(run: &mut Run, id: &str, status: RunTaskStatus) {
        run.tasks.get_mut(&TaskId::from(id)).expect("task").status = status;
    }

    fn status_of(run: &Run, id: &str) -> RunTaskStatus {
        run.tasks[&TaskId::from(id)].status
    }

    fn ids(tasks: &[TaskId]) -> Vec<&str> {
        tasks.iter().map(TaskId::as_str).collect()
    }

    #[test]
    fn advance_leaves_top_level_tasks_alone() {
        let rc = test_config();
        let mut run = test_run(&rc);
        advance_run_tasks(&mut run, &rc).expect("advance");
        for id in ["task01", "task02", "task03", "task04", "task05"] {
            assert_eq!(status_of(&run, id), RunTaskStatus::NotStarted);
        }
    }

    #[test]
    fn advance_skips_child_of_skipped_parent() {
        let mut rc = test_config();
        rc.tasks.get_mut(&TaskId::from("task01")).expect("task").skip = true;
        let mut run = test_run(&rc);
        set_status(&mut run, "task01", RunTaskStatus::Skipped);

        advance_run_tasks(&mut run, &rc).expect("advance");

        assert_eq!(status_of(&run, "task02"), RunTaskStatus::Skipped);
    }

    #[test]
    fn advance_skips_task_when_all_parents_skipped() {
        let mut rc = test_config();
        rc.tasks.get_mut(&TaskId::from("task03")).expect("task").skip = true;
        rc.tasks.get_mut(&TaskId::from("task04")).expect("task").skip = true;
        let mut run = test_run(&rc);
        set_status(&mut run, "task03", RunTaskStatus::Skipped);
        set_status(&mut run, "task04", RunTaskStatus::Skipped);

        advance_run_tasks(&mut run, &rc).expect("advance");

        assert_eq!(status_of(&run, "task05"), RunTaskStatus::Skipped);
    }

    #[test]
    fn advance_keeps_task_when_not_all_parents_skipped() {
        let mut rc = test_config();
        rc.tasks.get_mut(&TaskId::from("task03")).expect("task").skip = true;
        let mut run = test_run(&rc);
        set_status(&mut run, "task03", RunTaskStatus::Skipped);
        set_status(&mut run, "task04", RunTaskStatus::Success);

        advance_run_tasks(&mut run, &rc).expect("advance");

        // task04 satisfies its edge, so task05 is not dead - it just
        // can never run (task03's edge is unsatisfied).
        assert_eq!(status_of(&run, "task05"), RunTaskStatus::NotStarted);
    }

    #[test]
    fn advance_propagates_skip_through_chains_in_one_pass() {
        // task01 skipped ⇒ task02 skipped ⇒ task06 skipped, all in a
        // single topological pass.
        let mut rc = test_config();
        rc.tasks.insert(
            TaskId::from("task06"),
            config_task_with_deps("task06", &["task02"]),
        );
        let mut run = test_run(&rc);
        set_status(&mut run, "task01", RunTaskStatus::Skipped);

        advance_run_tasks(&mut run, &rc).expect("advance");
        assert_eq!(status_of(&run, "task02"), RunTaskStatus::Skipped);
        assert_eq!(status_of(&run, "task06"), RunTaskStatus::Skipped);
    }

    #[test]
    fn advance_skips_on_failed_dependency_precondition() {
        let rc = test_config();
        let mut run = test_run(&rc);
        set_status(&mut run, "task01", RunTaskStatus::Failed);

        advance_run_tasks(&mut run, &rc).expect("advance");

        // Default condition is on_success; a failed parent kills the child.
        assert_eq!(status_of(&run, "task02"), RunTaskStatus::Skipped);
    }

    #[test]
    fn advance_respects_on_failure_conditions() {
        let mut rc = test_config();
        rc.tasks
            .get_mut(&TaskId::from("task02"))
            .expect("task")
            .depends[0]
            .conditions = vec![DependCondition::OnFailure];
        let mut run = test_run(&rc);
        set_status(&mut run, "task01", RunTaskStatus::Failed);

        advance_run_tasks(&mut run, &rc).expect("advance");

        assert_eq!(status_of(&run, "task02"), RunTaskStatus::NotStarted);
        let eligible = get_tasks_to_run(&mut run, &rc).expect("eligible");
        assert!(eligible.contains(&TaskId::from("task02")));
    }

    #[test]
    fn eligibility_returns_top_level_tasks() {
        let rc = test_config();
        let mut run = test_run(&rc);
        let tasks = get_tasks_to_run(&mut run, &rc).expect("eligible");
        assert_eq!(ids(&tasks), vec!["task01", "task03", "task04"]);
    }

    #[test]
    fn eligibility_ignores_skipped_tasks() {
        let mut rc = test_config();
        rc.tasks.get_mut(&TaskId::from("task01")).expect("task").skip = true;
        let mut run = test_run(&rc);
        set_status(&mut run, "task01", RunTaskStatus::Skipped);
        set_status(&mut run, "task02", RunTaskStatus::Skipped);

        let tasks = get_tasks_to_run(&mut run, &rc).expect("eligible");
        assert_eq!(ids(&tasks), vec!["task03", "task04"]);
    }

    #[test]
    fn eligibility_holds_unapproved_tasks() {
        let mut rc = test_config();
        rc.tasks
            .get_mut(&TaskId::from("task01"))
            .expect("task")
            .needs_approval = true;
        let mut run = test_run(&rc);

        let tasks = get_tasks_to_run(&mut run, &rc).expect("eligible");
        assert_eq!(ids(&tasks), vec!["task03", "task04"]);
        assert_eq!(status_of(&run, "task01"), RunTaskStatus::WaitingApproval);

        // A second pass is stable: still gated, still not returned.
        let tasks = get_tasks_to_run(&mut run, &rc).expect("eligible");
        assert_eq!(ids(&tasks), vec!["task03", "task04"]);
    }

    #[test]
    fn eligibility_returns_approved_tasks() {
        let mut rc = test_config();
        rc.tasks
            .get_mut(&TaskId::from("task01"))
            .expect("task")
            .needs_approval = true;
        let mut run = test_run(&rc);
        run.tasks
            .get_mut(&TaskId::from("task01"))
            .expect("task")
            .approved = true;

        let tasks = get_tasks_to_run(&mut run, &rc).expect("eligible");
        assert_eq!(ids(&tasks), vec!["task01", "task03", "task04"]);
    }

    #[test]
    fn eligibility_never_returns_started_tasks() {
        let rc = test_config();
        let mut run = test_run(&rc);
        set_status(&mut run, "task01", RunTaskStatus::Running);
        set_status(&mut run, "task03", RunTaskStatus::Success);

        let tasks = get_tasks_to_run(&mut run, &rc).expect("eligible");
        assert_eq!(ids(&tasks), vec!["task04"]);
    }

    #[test]
    fn eligibility_after_parent_success_unlocks_children() {
        let rc = test_config();
        let mut run = test_run(&rc);
        set_status(&mut run, "task01", RunTaskStatus::Success);

        let tasks = get_tasks_to_run(&mut run, &rc).expect("eligible");
        assert_eq!(ids(&tasks), vec!["task02", "task03", "task04"]);
    }

    #[test]
    fn stop_kills_pending_tasks_only() {
        let rc = test_config();
        let mut run = test_run(&rc);
        set_status(&mut run, "task01", RunTaskStatus::Running);
        run.stop = true;

        apply_stop(&mut run);

        assert_eq!(run.phase, RunPhase::Cancelled);
        assert_eq!(status_of(&run, "task01"), RunTaskStatus::Running);
        for id in ["task02", "task03", "task04", "task05"] {
            assert_eq!(status_of(&run, id), RunTaskStatus::Stopped);
        }
    }

    #[test]
    fn finalize_success() {
        let rc = test_config();
        let mut run = test_run(&rc);
        for id in ["task01", "task02", "task03", "task04", "task05"] {
            set_status(&mut run, id, RunTaskStatus::Success);
        }

        finalize_run(&mut run, &rc).expect("finalize");
        assert_eq!(run.phase, RunPhase::Finished);
        assert_eq!(run.result, RunResult::Success);
        assert!(run.end_time.is_some());
    }

    #[test]
    fn finalize_waits_for_nonterminal_tasks() {
        let rc = test_config();
        let mut run = test_run(&rc);
        set_status(&mut run, "task01", RunTaskStatus::Success);

        finalize_run(&mut run, &rc).expect("finalize");
        assert_eq!(run.phase, RunPhase::Queued);
        assert_eq!(run.result, RunResult::Unknown);
    }

    #[test]
    fn finalize_failed_beats_stopped() {
        let rc = test_config();
        let mut run = test_run(&rc);
        set_status(&mut run, "task01", RunTaskStatus::Failed);
        set_status(&mut run, "task02", RunTaskStatus::Stopped);
        for id in ["task03", "task04", "task05"] {
            set_status(&mut run, id, RunTaskStatus::Success);
        }

        finalize_run(&mut run, &rc).expect("finalize");
        assert_eq!(run.result, RunResult::Failed);
    }

    #[test]
    fn finalize_stopped_without_failures() {
        let rc = test_config();
        let mut run = test_run(&rc);
        set_status(&mut run, "task01", RunTaskStatus::Stopped);
        for id in ["task02", "task03", "task04", "task05"] {
            set_status(&mut run, id, RunTaskStatus::Skipped);
        }

        finalize_run(&mut run, &rc).expect("finalize");
        assert_eq!(run.result, RunResult::Stopped);
    }

    #[test]
    fn finalize_honors_ignore_failure() {
        let mut rc = test_config();
        rc.tasks
            .get_mut(&TaskId::from("task01"))
            .expect("task")
            .ignore_failure = true;
        let mut run = test_run(&rc);
        set_status(&mut run, "task01", RunTaskStatus::Failed);
        set_status(&mut run, "task02", RunTaskStatus::Skipped);
        for id in ["task03", "task04", "task05"] {
            set_status(&mut run, id, RunTaskStatus::Success);
        }

        finalize_run(&mut run, &rc).expect("finalize");
        assert_eq!(run.result, RunResult::Success);
    }

    #[test]
    fn skipped_tasks_count_as_success() {
        let mut rc = test_config();
        rc.tasks.get_mut(&TaskId::from("task01")).expect("task").skip = true;
        let mut run = test_run(&rc);
        set_status(&mut run, "task01", RunTaskStatus::Skipped);
        set_status(&mut run, "task02", RunTaskStatus::Skipped);
        for id in ["task03", "task04", "task05"] {
            set_status(&mut run, id, RunTaskStatus::Success);
        }

        finalize_run(&mut run, &rc).expect("finalize");
        assert_eq!(run.result, RunResult::Success);
    }

    #[test]
    fn advance_is_deterministic_and_idempotent() {
        let mut rc = test_config();
        rc.tasks.get_mut(&TaskId::from("task03")).expect("task").skip = true;
        rc.tasks.get_mut(&TaskId::from("task04")).expect("task").skip = true;

        let mut first = test_run(&rc);
        set_status(&mut first, "task03", RunTaskStatus::Skipped);
        set_status(&mut first, "task04", RunTaskStatus::Skipped);
        let mut second = first.clone();

        advance_run_tasks(&mut first, &rc).expect("advance");
        advance_run_tasks(&mut second, &rc).expect("advance");
        assert_eq!(first, second);

        // Re-running on already-advanced state changes nothing.
        let before = first.clone();
        advance_run_tasks(&mut first, &rc).expect("advance");
        assert_eq!(first.tasks, before.tasks);
    }

    #[test]
    fn cyclic_config_is_fatal() {
        let mut rc = test_config();
        rc.tasks
            .get_mut(&TaskId::from("task01"))
            .expect("task")
            .depends
            .push(RunConfigTaskDepend {
                task_id: TaskId::from("task02"),
                conditions: vec![],
            });
        let mut run = test_run(&rc);

        let err = advance_run_tasks(&mut run, &rc).unwrap_err();
        assert!(matches!(err, Error::Fatal { .. }));
    }
}
