//! Task graph for dependency management.
//!
//! `TaskGraph` holds a plan's tasks as nodes of a petgraph `DiGraph` with an
//! edge `dep -> task` for every dependency. It is the single owner of per-task
//! state while a plan executes.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Dfs, Reversed};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

pub struct TaskGraph {
    /// The underlying directed graph. Node order is insertion order.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a graph from tasks, wiring every `depends_on` edge.
    ///
    /// # Errors
    /// - `DuplicateTask` if two tasks share an id
    /// - `UnknownDependency` if a dependency names a task outside the set
    /// - `CycleDetected` if the edges do not form a DAG
    pub fn from_tasks<I>(tasks: I) -> Result<Self>
    where
        I: IntoIterator<Item = Task>,
    {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task)?;
        }

        let edges: Vec<(TaskId, TaskId)> = graph
            .graph
            .node_weights()
            .flat_map(|task| {
                task.depends_on
                    .iter()
                    .map(move |dep| (dep.clone(), task.id.clone()))
            })
            .collect();

        for (dep, task) in &edges {
            if !graph.contains_task(dep) {
                return Err(Error::UnknownDependency {
                    task: task.clone(),
                    missing: dep.clone(),
                });
            }
            graph.add_dependency(dep, task)?;
        }

        Ok(graph)
    }

    /// Add a task to the graph.
    pub fn add_task(&mut self, task: Task) -> Result<NodeIndex> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        Ok(index)
    }

    /// Add an edge meaning `from` must be Done before `to` can start.
    ///
    /// The edge is rolled back if it would close a cycle.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = self
            .get_node_index(from)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in graph", from)))?;
        let to_index = self
            .get_node_index(to)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in graph", to)))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::CycleDetected(to.clone()));
        }

        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    pub fn get_node_index(&self, id: &TaskId) -> Option<NodeIndex> {
        self.task_index.get(id).copied()
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Owned copy of every task, in insertion order.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks().cloned().collect()
    }

    /// Direct prerequisites of a task.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that directly depend on the given task.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task reachable forward from `id`, excluding `id` itself,
    /// in breadth-first order.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(start) = self.get_node_index(id) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut out = Vec::new();
        while let Some(nx) = bfs.next(&self.graph) {
            if nx != start {
                out.push(self.graph[nx].id.clone());
            }
        }
        out
    }

    /// Ancestors of `id` that ended Failed, Skipped or Blocked.
    pub fn unsuccessful_ancestors(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let Some(start) = self.get_node_index(id) else {
            return BTreeSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut out = BTreeSet::new();
        while let Some(nx) = dfs.next(reversed) {
            if nx == start {
                continue;
            }
            let task = &self.graph[nx];
            if task.status.is_unsuccessful() {
                out.insert(task.id.clone());
            }
        }
        out
    }

    /// Move Pending tasks whose dependencies are all Done to Ready.
    ///
    /// Returns the ids that changed state.
    pub fn promote_ready(&mut self) -> Vec<TaskId> {
        let promotable: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&index| {
                self.graph[index].status == TaskStatus::Pending
                    && self
                        .graph
                        .neighbors_directed(index, Direction::Incoming)
                        .all(|dep| self.graph[dep].status == TaskStatus::Done)
            })
            .collect();

        promotable
            .into_iter()
            .map(|index| {
                let task = &mut self.graph[index];
                task.mark_ready();
                task.id.clone()
            })
            .collect()
    }

    /// Ids of tasks currently in the given state, in insertion order.
    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks()
            .filter(|task| task.status == status)
            .map(|task| task.id.clone())
            .collect()
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks().filter(|task| task.status == status).count()
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks().all(Task::is_terminal)
    }

    /// Group tasks into waves: every task in wave `n` only depends on tasks
    /// in earlier waves. Within a wave, insertion order is kept.
    pub fn waves(&self) -> Vec<Vec<TaskId>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|index| {
                let degree = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count();
                (index, degree)
            })
            .collect();

        let mut current: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|index| in_degree[index] == 0)
            .collect();
        let mut waves = Vec::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &index in &current {
                for dependent in self.graph.neighbors_directed(index, Direction::Outgoing) {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            next.sort();
            next.dedup();
            waves.push(
                current
                    .iter()
                    .map(|&index| self.graph[index].id.clone())
                    .collect(),
            );
            current = next;
        }

        waves
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
