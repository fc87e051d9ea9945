// tests/property_dag.rs

mod common;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use proptest::prelude::*;

use stevedore::dag::{plan, validate, DagEngine, EngineSettings, RunOptions, TaskState, Workflow};
use stevedore::errors::StevedoreError;
use stevedore_test_utils::builders::{TaskBuilder, WorkflowBuilder};
use stevedore_test_utils::fake_executor::ScriptedExecutor;

// Strategy to generate a valid DAG.
// Acyclicity is ensured by only allowing task N to depend on tasks 0..N-1;
// declaration order is then shuffled so forward references are exercised.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = Workflow> {
    (1..=max_tasks).prop_flat_map(|num_tasks| {
        let deps = proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..3),
            num_tasks,
        );
        let order = Just((0..num_tasks).collect::<Vec<_>>()).prop_shuffle();
        (deps, order).prop_map(|(raw_deps, order)| {
            let tasks: Vec<_> = raw_deps
                .into_iter()
                .enumerate()
                .map(|(i, potential)| {
                    let deps: BTreeSet<String> = potential
                        .into_iter()
                        .filter(|_| i > 0)
                        .map(|d| format!("t{}", d % i))
                        .collect();
                    let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                    TaskBuilder::new(&format!("t{i}")).after(&deps).build()
                })
                .collect();
            order
                .into_iter()
                .fold(WorkflowBuilder::new("prop"), |b, idx| b.with(tasks[idx].clone()))
                .build()
        })
    })
}

fn depth_of(layers: &[Vec<String>]) -> HashMap<String, usize> {
    layers
        .iter()
        .enumerate()
        .flat_map(|(depth, layer)| layer.iter().map(move |t| (t.clone(), depth)))
        .collect()
}

proptest! {
    #[test]
    fn layers_are_a_minimal_topological_partition(wf in dag_strategy(12)) {
        let layers = plan(&wf).expect("generated DAGs are acyclic");
        let depth = depth_of(&layers);

        // Every task is planned exactly once.
        let planned: usize = layers.iter().map(Vec::len).sum();
        prop_assert_eq!(planned, wf.tasks.len());
        prop_assert_eq!(depth.len(), wf.tasks.len());

        for task in &wf.tasks {
            let d = depth[&task.name];
            let expected = task
                .depends_on
                .iter()
                .map(|dep| depth[dep] + 1)
                .max()
                .unwrap_or(0);
            // One layer after its deepest dependency, never later.
            prop_assert_eq!(d, expected, "task {}", task.name);
        }

        // Within a layer, declaration order is preserved.
        let position: HashMap<&str, usize> =
            wf.task_names().enumerate().map(|(i, n)| (n, i)).collect();
        for layer in &layers {
            let idx: Vec<usize> = layer.iter().map(|t| position[t.as_str()]).collect();
            prop_assert!(idx.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn closing_a_chain_is_always_a_cycle(len in 1usize..8) {
        let mut builder = WorkflowBuilder::new("ring");
        for i in 0..len {
            let dep = format!("t{}", (i + len - 1) % len);
            builder = builder.with(TaskBuilder::new(&format!("t{i}")).after(&[dep.as_str()]).build());
        }
        match validate(&builder.build()) {
            Err(StevedoreError::CycleDetected { tasks }) => {
                prop_assert_eq!(tasks.first(), tasks.last());
                prop_assert_eq!(tasks.len(), len + 1);
            }
            other => prop_assert!(false, "expected cycle, got {:?}", other),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn failures_skip_exactly_their_transitive_dependents(
        wf in dag_strategy(8),
        failing in proptest::collection::btree_set(0usize..8, 0..3),
    ) {
        let failing: BTreeSet<String> = failing
            .into_iter()
            .filter(|i| *i < wf.tasks.len())
            .map(|i| format!("t{i}"))
            .collect();

        let (_dir, store) = common::temp_store();
        let mut executor = ScriptedExecutor::new();
        for name in &failing {
            executor = executor.failing(name, 1);
        }
        let engine = DagEngine::new(Arc::new(executor), store, EngineSettings::default());

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let execution = rt
            .block_on(engine.run(&wf, RunOptions::manual()))
            .expect("run")
            .into_execution()
            .expect("executed");

        // Expected state: failed if scripted to fail and all deps succeeded,
        // skipped if any dependency did not succeed, succeeded otherwise.
        let layers = plan(&wf).unwrap();
        let mut expected: HashMap<String, TaskState> = HashMap::new();
        for layer in &layers {
            for name in layer {
                let task = wf.task(name).unwrap();
                let blocked = task
                    .depends_on
                    .iter()
                    .any(|d| expected[d] != TaskState::Succeeded);
                let state = if blocked {
                    TaskState::Skipped
                } else if failing.contains(name) {
                    TaskState::Failed
                } else {
                    TaskState::Succeeded
                };
                expected.insert(name.clone(), state);
            }
        }

        for record in &execution.tasks {
            prop_assert_eq!(record.state, expected[&record.task], "task {}", record.task);
            let ran = record.state != TaskState::Skipped;
            prop_assert_eq!(record.attempts, u32::from(ran));
        }
    }
}
