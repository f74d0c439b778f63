//! Property tests for the scheduler's pure passes.

use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};

use capstan_core::{ProjectId, RunId, TaskId};
use capstan_runservice::{
    advance_run_tasks, get_tasks_to_run, Run, RunConfig, RunConfigTask, RunConfigTaskDepend,
    RunPhase, RunResult, RunTask, RunTaskStatus, Runtime,
};

#[derive(Debug, Clone)]
struct GeneratedConfig {
    rc: RunConfig,
    statuses: Vec<RunTaskStatus>,
}

fn status_strategy() -> impl Strategy<Value = RunTaskStatus> {
    prop_oneof![
        Just(RunTaskStatus::NotStarted),
        Just(RunTaskStatus::Running),
        Just(RunTaskStatus::Skipped),
        Just(RunTaskStatus::Stopped),
        Just(RunTaskStatus::Failed),
        Just(RunTaskStatus::Success),
    ]
}

/// Random DAG: task `i` may depend on any subset of tasks `< i`, which
/// guarantees acyclicity by construction.
fn config_strategy() -> impl Strategy<Value = GeneratedConfig> {
    (2usize..7).prop_flat_map(|n| {
        let deps = proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n);
        let statuses = proptest::collection::vec(status_strategy(), n);
        (deps, statuses).prop_map(move |(dep_matrix, statuses)| {
            let mut tasks = BTreeMap::new();
            for i in 0..n {
                let id = TaskId::from(format!("task{i:02}"));
                let depends = (0..i)
                    .filter(|j| dep_matrix[i][*j])
                    .map(|j| RunConfigTaskDepend {
                        task_id: TaskId::from(format!("task{j:02}")),
                        conditions: vec![],
                    })
                    .collect();
                tasks.insert(
                    id.clone(),
                    RunConfigTask {
                        id: id.clone(),
                        name: id.to_string(),
                        depends,
                        runtime: Runtime::pod("image01"),
                        environment: HashMap::new(),
                        steps: vec![],
                        skip: false,
                        needs_approval: false,
                        ignore_failure: false,
                        required_labels: HashMap::new(),
                    },
                );
            }
            GeneratedConfig {
                rc: RunConfig {
                    id: RunId::generate(),
                    tasks,
                },
                statuses,
            }
        })
    })
}

fn build_run(generated: &GeneratedConfig) -> Run {
    let tasks = generated
        .rc
        .tasks
        .keys()
        .zip(&generated.statuses)
        .map(|(id, status)| (id.clone(), RunTask::new(id.clone(), *status)))
        .collect();
    Run {
        id: generated.rc.id,
        name: "run01".into(),
        project_id: ProjectId::generate(),
        group: "org/o1/p1".into(),
        phase: RunPhase::Running,
        result: RunResult::Unknown,
        stop: false,
        annotations: HashMap::new(),
        tasks,
        enqueue_time: None,
        start_time: None,
        end_time: None,
    }
}

proptest! {
    /// Advancing is deterministic and idempotent.
    #[test]
    fn advance_is_deterministic_and_idempotent(generated in config_strategy()) {
        let mut first = build_run(&generated);
        let mut second = build_run(&generated);

        advance_run_tasks(&mut first, &generated.rc).expect("advance");
        advance_run_tasks(&mut second, &generated.rc).expect("advance");
        prop_assert_eq!(&first.tasks, &second.tasks);

        let before = first.clone();
        advance_run_tasks(&mut first, &generated.rc).expect("advance");
        prop_assert_eq!(&first.tasks, &before.tasks);
    }

    /// Advancing never moves a task down the status ranks.
    #[test]
    fn advance_is_monotonic(generated in config_strategy()) {
        let mut run = build_run(&generated);
        let before: Vec<RunTaskStatus> = run.tasks.values().map(|t| t.status).collect();

        advance_run_tasks(&mut run, &generated.rc).expect("advance");

        for (task, old) in run.tasks.values().zip(before) {
            prop_assert!(task.status.rank() >= old.rank());
        }
    }

    /// Every dependency of a task skipped: the task ends up skipped.
    #[test]
    fn skip_propagates(generated in config_strategy()) {
        let mut run = build_run(&generated);
        advance_run_tasks(&mut run, &generated.rc).expect("advance");

        for (task_id, rct) in &generated.rc.tasks {
            if rct.depends.is_empty() {
                continue;
            }
            let all_skipped = rct
                .depends
                .iter()
                .all(|d| run.tasks[&d.task_id].status == RunTaskStatus::Skipped);
            let was_pending = matches!(
                generated.statuses[generated
                    .rc
                    .tasks
                    .keys()
                    .position(|k| k == task_id)
                    .expect("index")],
                RunTaskStatus::NotStarted
            );
            if all_skipped && was_pending {
                prop_assert_eq!(run.tasks[task_id].status, RunTaskStatus::Skipped);
            }
        }
    }

    /// Eligibility only ever returns pending tasks with fully
    /// satisfied dependencies.
    #[test]
    fn eligibility_is_sound(generated in config_strategy()) {
        let mut run = build_run(&generated);
        advance_run_tasks(&mut run, &generated.rc).expect("advance");

        let snapshot = run.clone();
        let eligible = get_tasks_to_run(&mut run, &generated.rc).expect("eligible");

        for task_id in &eligible {
            prop_assert_eq!(snapshot.tasks[task_id].status, RunTaskStatus::NotStarted);
            for dep in &generated.rc.tasks[task_id].depends {
                let dep_status = snapshot.tasks[&dep.task_id].status;
                prop_assert!(dep_status.is_terminal());
                prop_assert!(dep.satisfied_by(dep_status));
            }
        }
    }
}
