// src/dag/graph.rs

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::dag::workflow::Workflow;
use crate::errors::{Result, StevedoreError};
use crate::types::TaskName;

/// Internal node structure: stores immediate deps and dependents by index.
#[derive(Debug, Clone)]
struct DagNode {
    name: TaskName,
    /// Direct dependencies: tasks that must succeed before this one can run.
    deps: Vec<usize>,
    /// Direct dependents: tasks that depend on this one.
    dependents: Vec<usize>,
}

/// In-memory DAG of a workflow's tasks, indexed in declaration order.
///
/// Construction only checks that every dependency names a known task.
/// Acyclicity is checked separately by [`DagGraph::find_cycle`] so that
/// callers can report the participating tasks.
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: Vec<DagNode>,
    index: HashMap<TaskName, usize>,
}

impl DagGraph {
    /// Build adjacency from `depends_on`.
    ///
    /// Fails with `UnknownDependency` for a reference to a task that is not
    /// in the workflow, and with `ConfigError` for duplicate task names.
    pub fn build(workflow: &Workflow) -> Result<Self> {
        let mut index = HashMap::with_capacity(workflow.tasks.len());
        for (i, task) in workflow.tasks.iter().enumerate() {
            if index.insert(task.name.clone(), i).is_some() {
                return Err(StevedoreError::ConfigError(format!(
                    "workflow '{}' declares task '{}' more than once",
                    workflow.name, task.name
                )));
            }
        }

        let mut nodes: Vec<DagNode> = workflow
            .tasks
            .iter()
            .map(|t| DagNode {
                name: t.name.clone(),
                deps: Vec::new(),
                dependents: Vec::new(),
            })
            .collect();

        for (i, task) in workflow.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let Some(&d) = index.get(dep) else {
                    return Err(StevedoreError::UnknownDependency {
                        task: task.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                if !nodes[i].deps.contains(&d) {
                    nodes[i].deps.push(d);
                    nodes[d].dependents.push(i);
                }
            }
        }

        Ok(Self { nodes, index })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Task names in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Declaration position of a task.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Immediate dependencies of a task.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, |n| &n.deps)
    }

    /// Immediate dependents of a task.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, |n| &n.dependents)
    }

    /// Tasks nothing depends on.
    pub fn sinks(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.dependents.is_empty())
            .map(|n| n.name.as_str())
            .collect()
    }

    fn neighbours(&self, name: &str, pick: impl Fn(&DagNode) -> &Vec<usize>) -> Vec<&str> {
        match self.index.get(name) {
            Some(&i) => pick(&self.nodes[i])
                .iter()
                .map(|&j| self.nodes[j].name.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Depth-first search over dependency edges with an explicit recursion
    /// stack. Returns the tasks on the first cycle found, in dependency
    /// order, starting and ending with the same task.
    pub fn find_cycle(&self) -> Option<Vec<TaskName>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];

        for root in 0..self.nodes.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }

            // (node, next dependency position to explore)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::OnStack;

            while let Some(top) = stack.last_mut() {
                let (node, pos) = *top;
                if let Some(&dep) = self.nodes[node].deps.get(pos) {
                    top.1 += 1;
                    match marks[dep] {
                        Mark::Unvisited => {
                            marks[dep] = Mark::OnStack;
                            stack.push((dep, 0));
                        }
                        Mark::OnStack => {
                            let start = stack
                                .iter()
                                .position(|&(n, _)| n == dep)
                                .unwrap_or(0);
                            let mut cycle: Vec<TaskName> = stack[start..]
                                .iter()
                                .map(|&(n, _)| self.nodes[n].name.clone())
                                .collect();
                            cycle.push(self.nodes[dep].name.clone());
                            // The stack walks from dependent to dependency;
                            // report it in execution order instead.
                            cycle.reverse();
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }

        None
    }

    /// Topological layers: every task sits one layer after its deepest
    /// dependency. Tasks within a layer keep declaration order.
    ///
    /// Assumes the graph is acyclic; call [`find_cycle`](Self::find_cycle)
    /// first.
    pub fn layers(&self) -> Result<Vec<Vec<TaskName>>> {
        let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(self.nodes.len(), 0);
        let ids: Vec<NodeIndex> = (0..self.nodes.len()).map(|i| graph.add_node(i)).collect();
        for (i, node) in self.nodes.iter().enumerate() {
            for &d in &node.deps {
                graph.add_edge(ids[d], ids[i], ());
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            let name = self.nodes[graph[cycle.node_id()]].name.clone();
            StevedoreError::CycleDetected { tasks: vec![name] }
        })?;

        let mut depth = vec![0usize; self.nodes.len()];
        for id in order {
            let i = graph[id];
            depth[i] = self.nodes[i]
                .deps
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }

        let layer_count = depth.iter().copied().max().map_or(0, |d| d + 1);
        let mut layers: Vec<Vec<TaskName>> = vec![Vec::new(); layer_count];
        for (i, node) in self.nodes.iter().enumerate() {
            layers[depth[i]].push(node.name.clone());
        }
        Ok(layers)
    }
}

/// Check a workflow's dependency structure.
///
/// Fails with `UnknownDependency` or `CycleDetected`; on success returns the
/// graph for further use.
pub fn validate(workflow: &Workflow) -> Result<DagGraph> {
    let graph = DagGraph::build(workflow)?;
    if let Some(tasks) = graph.find_cycle() {
        return Err(StevedoreError::CycleDetected { tasks });
    }
    Ok(graph)
}

/// Validate and then compute the execution layers of a workflow.
pub fn plan(workflow: &Workflow) -> Result<Vec<Vec<TaskName>>> {
    validate(workflow)?.layers()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::workflow::Task;

    fn task(name: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(name, "busybox", ["true"]);
        t.depends_on = deps.iter().map(|d| d.to_string()).collect();
        t
    }

    #[test]
    fn layers_follow_declaration_order() {
        let wf = Workflow::new(
            "wf",
            vec![
                task("c", &["a", "b"]),
                task("b", &[]),
                task("a", &[]),
                task("d", &["a"]),
            ],
        );
        let layers = plan(&wf).expect("plan");
        assert_eq!(layers, vec![vec!["b", "a"], vec!["c", "d"]]);
    }

    #[test]
    fn cycle_is_reported_in_order() {
        let wf = Workflow::new(
            "wf",
            vec![task("a", &["c"]), task("b", &["a"]), task("c", &["b"])],
        );
        match validate(&wf) {
            Err(StevedoreError::CycleDetected { tasks }) => {
                assert_eq!(tasks.first(), tasks.last());
                assert_eq!(tasks.len(), 4);
                for name in ["a", "b", "c"] {
                    assert!(tasks.iter().any(|t| t == name));
                }
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let wf = Workflow::new("wf", vec![task("a", &["a"])]);
        match validate(&wf) {
            Err(StevedoreError::CycleDetected { tasks }) => assert_eq!(tasks, vec!["a", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn sinks_are_tasks_without_dependents() {
        let wf = Workflow::new(
            "wf",
            vec![task("extract", &[]), task("transform", &["extract"]), task("load", &["transform"])],
        );
        let graph = validate(&wf).expect("valid");
        assert_eq!(graph.sinks(), vec!["load"]);
        assert_eq!(graph.dependencies_of("load"), vec!["transform"]);
        assert_eq!(graph.dependents_of("extract"), vec!["transform"]);
    }
}
