// src/dag/graph.rs

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{BatchdagError, Result};
use crate::types::{TaskDescriptor, TaskId};

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone, Default)]
struct DagNode {
    /// Direct dependencies: tasks that must complete before this one can run.
    deps: Vec<TaskId>,
    /// Direct dependents: tasks that depend on this one.
    dependents: Vec<TaskId>,
}

/// Dependency graph resolver over a batch's task descriptors.
///
/// Holds forward (`deps`) and reverse (`dependents`) adjacency plus the
/// declaration order of the descriptors. Every query that returns a list of
/// tasks returns it in declaration order, which is what the scheduler uses
/// as its admission tie-break.
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: HashMap<TaskId, DagNode>,
    order: Vec<TaskId>,
}

impl DagGraph {
    /// Build the adjacency maps without validating anything.
    ///
    /// Duplicate entries inside one `depends_on` list are collapsed.
    /// Dependencies on unknown ids are kept as forward edges only, so
    /// [`DagGraph::topological_order`] will refuse such a graph.
    pub fn new(descriptors: &[TaskDescriptor]) -> Self {
        let mut nodes: HashMap<TaskId, DagNode> = HashMap::new();
        let mut order = Vec::with_capacity(descriptors.len());

        // First pass: create nodes with their dependency lists.
        for desc in descriptors {
            let mut seen = HashSet::new();
            let deps = desc
                .depends_on
                .iter()
                .filter(|d| seen.insert(d.as_str()))
                .cloned()
                .collect();
            if nodes
                .insert(
                    desc.id.clone(),
                    DagNode {
                        deps,
                        dependents: Vec::new(),
                    },
                )
                .is_none()
            {
                order.push(desc.id.clone());
            }
        }

        // Second pass: populate dependents, in declaration order.
        for task_id in &order {
            let deps = nodes
                .get(task_id)
                .map(|n| n.deps.clone())
                .unwrap_or_default();

            for dep in deps {
                if let Some(dep_node) = nodes.get_mut(&dep) {
                    dep_node.dependents.push(task_id.clone());
                }
            }
        }

        Self { nodes, order }
    }

    /// Build the graph and reject anything that could never be scheduled:
    /// duplicate ids, unknown dependencies and cycles.
    pub fn validated(descriptors: &[TaskDescriptor]) -> Result<Self> {
        let mut ids = HashSet::new();
        for desc in descriptors {
            if !ids.insert(desc.id.as_str()) {
                return Err(BatchdagError::DuplicateTask(desc.id.clone()));
            }
        }

        for desc in descriptors {
            for dep in &desc.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(BatchdagError::UnknownDependency {
                        task: desc.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let graph = Self::new(descriptors);
        graph.topological_order()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// All task ids in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    /// Immediate dependencies of a task.
    pub fn dependencies_of(&self, id: &str) -> &[TaskId] {
        self.nodes
            .get(id)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a task.
    pub fn dependents_of(&self, id: &str) -> &[TaskId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Tasks without dependencies.
    pub fn entry_points(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| self.dependencies_of(id).is_empty())
            .cloned()
            .collect()
    }

    /// Tasks nothing depends on.
    pub fn exit_points(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| self.dependents_of(id).is_empty())
            .cloned()
            .collect()
    }

    /// Kahn's algorithm.
    ///
    /// The zero in-degree queue is seeded in declaration order, so among
    /// independent tasks the earlier-declared one comes first. Fails with
    /// [`BatchdagError::CyclicDependency`] (and no partial order) when some
    /// task can never reach in-degree zero.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|id| (id.as_str(), self.dependencies_of(id).len()))
            .collect();

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .map(|id| id.as_str())
            .filter(|id| in_degree[id] == 0)
            .collect();

        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = queue.pop_front() {
            sorted.push(id.to_string());

            for dependent in self.dependents_of(id) {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }

        if sorted.len() < self.order.len() {
            let stuck: Vec<&str> = self
                .order
                .iter()
                .map(|id| id.as_str())
                .filter(|id| in_degree[id] > 0)
                .collect();
            return Err(BatchdagError::CyclicDependency(format!(
                "cycle detected among tasks: {}",
                stuck.join(", ")
            )));
        }

        Ok(sorted)
    }

    /// Parallel execution levels.
    ///
    /// `level(t) = 0` without dependencies, otherwise one more than the
    /// deepest dependency. Informational only; the scheduler admits by live
    /// readiness, not level by level.
    pub fn levels(&self) -> Result<Vec<Vec<TaskId>>> {
        let topo = self.topological_order()?;
        let mut level_of: HashMap<&str, usize> = HashMap::with_capacity(topo.len());

        for id in &topo {
            let level = self
                .dependencies_of(id)
                .iter()
                .filter_map(|d| level_of.get(d.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(id.as_str(), level);
        }

        let depth = level_of.values().max().map(|m| m + 1).unwrap_or(0);
        let mut levels = vec![Vec::new(); depth];
        for id in &self.order {
            levels[level_of[id.as_str()]].push(id.clone());
        }

        Ok(levels)
    }

    /// Tasks that are neither completed nor running and whose every
    /// dependency is completed, in declaration order.
    pub fn ready_set(&self, completed: &HashSet<TaskId>, running: &HashSet<TaskId>) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| !completed.contains(*id) && !running.contains(*id))
            .filter(|id| {
                self.dependencies_of(id)
                    .iter()
                    .all(|dep| completed.contains(dep))
            })
            .cloned()
            .collect()
    }

    /// Every task `id` transitively depends on.
    pub fn ancestors(&self, id: &str) -> HashSet<TaskId> {
        self.walk(id, |node| &node.deps)
    }

    /// Every task that transitively depends on `id`.
    pub fn descendants(&self, id: &str) -> HashSet<TaskId> {
        self.walk(id, |node| &node.dependents)
    }

    fn walk<'a>(&'a self, id: &str, next: impl Fn(&'a DagNode) -> &'a Vec<TaskId>) -> HashSet<TaskId> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);

        while let Some(current) = queue.pop_front() {
            let Some(node) = self.nodes.get(current) else {
                continue;
            };
            for neighbour in next(node) {
                if seen.insert(neighbour.clone()) {
                    queue.push_back(neighbour.as_str());
                }
            }
        }

        seen
    }

    /// Would making `task` depend on `dependency` introduce a cycle?
    ///
    /// Answers against a scratch copy of the edges; the graph itself is
    /// never modified.
    pub fn would_create_cycle(&self, task: &str, dependency: &str) -> bool {
        if task == dependency {
            return true;
        }

        // Edge direction: dep -> task.
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for id in &self.order {
            graph.add_node(id.as_str());
        }
        for id in &self.order {
            for dep in self.dependencies_of(id) {
                graph.add_edge(dep.as_str(), id.as_str(), ());
            }
        }

        if !graph.contains_node(task) || !graph.contains_node(dependency) {
            return false;
        }

        // The new edge dependency -> task closes a cycle iff task already
        // reaches dependency.
        has_path_connecting(&graph, task, dependency, None)
    }
}
