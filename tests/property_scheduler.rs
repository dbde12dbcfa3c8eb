// tests/property_scheduler.rs

use std::collections::{HashMap, HashSet};

use batchdag::dag::DagGraph;
use batchdag::engine::{BatchCore, CoreCommand, RuntimeEvent, TaskOutcome};
use batchdag::exec::TaskRun;
use batchdag::state::{BatchStatus, SourceRef, TaskStatus, create_initial};
use batchdag::types::TaskDescriptor;
use batchdag_test_utils::BatchBuilder;
use chrono::Utc;
use proptest::prelude::*;

// Acyclic by construction: task N may only depend on tasks 0..N-1.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<TaskDescriptor>> {
    (1..=max_tasks).prop_flat_map(|num_tasks| {
        proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..num_tasks),
            num_tasks,
        )
        .prop_map(|raw_deps| {
            let mut builder = BatchBuilder::new();
            for (i, potential) in raw_deps.into_iter().enumerate() {
                let deps: HashSet<String> = if i == 0 {
                    HashSet::new()
                } else {
                    potential
                        .into_iter()
                        .map(|d| format!("task_{}", d % i))
                        .collect()
                };
                let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                builder = builder.task(&format!("task_{i}"), &deps);
            }
            builder.build()
        })
    })
}

fn dispatched(commands: &[CoreCommand]) -> Vec<TaskRun> {
    commands
        .iter()
        .filter_map(|c| match c {
            CoreCommand::Dispatch(runs) => Some(runs.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

proptest! {
    #[test]
    fn topological_order_respects_every_edge(tasks in dag_strategy(12)) {
        let graph = DagGraph::validated(&tasks).unwrap();
        let order = graph.topological_order().unwrap();
        prop_assert_eq!(order.len(), tasks.len());

        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        for task in &tasks {
            for dep in &task.depends_on {
                prop_assert!(position[dep.as_str()] < position[task.id.as_str()]);
            }
        }
    }

    #[test]
    fn ready_set_only_holds_tasks_with_completed_deps(
        tasks in dag_strategy(12),
        completed_mask in proptest::collection::vec(any::<bool>(), 12),
    ) {
        let graph = DagGraph::validated(&tasks).unwrap();
        let completed: HashSet<String> = tasks
            .iter()
            .zip(completed_mask.iter())
            .filter(|(_, done)| **done)
            .map(|(t, _)| t.id.clone())
            .collect();

        let ready = graph.ready_set(&completed, &HashSet::new());
        for id in &ready {
            prop_assert!(!completed.contains(id));
            for dep in graph.dependencies_of(id) {
                prop_assert!(completed.contains(dep));
            }
        }
        // Nothing eligible is left out.
        for task in &tasks {
            let eligible = !completed.contains(&task.id)
                && task.depends_on.iter().all(|d| completed.contains(d));
            prop_assert_eq!(eligible, ready.contains(&task.id));
        }
    }

    #[test]
    fn core_respects_concurrency_and_completes_everything(
        tasks in dag_strategy(10),
        concurrency in 1usize..4,
        picks in proptest::collection::vec(any::<usize>(), 64),
    ) {
        let graph = DagGraph::validated(&tasks).unwrap();
        let state = create_initial(
            "prop",
            "prop",
            SourceRef::default(),
            tasks.iter().map(|t| t.id.clone()),
        );
        let mut core = BatchCore::new(graph, tasks.clone(), state, concurrency);

        let step = core.begin(Utc::now(), false);
        let mut running: Vec<TaskRun> = dispatched(&step.commands);
        let mut keep_running = step.keep_running;
        let mut finished_order: Vec<String> = Vec::new();
        let mut pick = picks.iter().cycle();

        while keep_running {
            prop_assert!(!running.is_empty());
            prop_assert!(running.len() <= concurrency);

            // Finish an arbitrary running task.
            let idx = pick.next().copied().unwrap_or(0) % running.len();
            let run = running.remove(idx);
            finished_order.push(run.id().to_string());

            let step = core.handle_event(
                RuntimeEvent::TaskFinished {
                    task: run.id().to_string(),
                    attempt: run.attempt,
                    outcome: TaskOutcome::Completed { result: String::new() },
                },
                Utc::now(),
            );
            running.extend(dispatched(&step.commands));
            keep_running = step.keep_running;
        }

        prop_assert!(running.is_empty());
        prop_assert_eq!(core.state().status, BatchStatus::Completed);
        prop_assert_eq!(finished_order.len(), tasks.len());
        prop_assert!(core
            .state()
            .tasks
            .values()
            .all(|t| t.status == TaskStatus::Completed && t.attempts == 1));

        // A task only ran after all of its dependencies had finished.
        let position: HashMap<&str, usize> = finished_order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        for task in &tasks {
            for dep in &task.depends_on {
                prop_assert!(position[dep.as_str()] < position[task.id.as_str()]);
            }
        }
    }
}
