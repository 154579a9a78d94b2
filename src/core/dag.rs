//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! Edges point from a dependency to the task that needs it. The DAG validates
//! task batches before they are persisted and groups tasks into execution
//! levels for the worker pool.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// The task dependency graph.
pub struct TaskDAG {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a DAG from a batch of tasks using their declared dependencies.
    ///
    /// # Errors
    /// Returns `Error::Validation` if a dependency names a task outside the
    /// batch, if ids repeat, or if the dependencies form a cycle.
    pub fn from_tasks(tasks: &[Task]) -> Result<Self> {
        let mut dag = Self::new();
        for task in tasks {
            if dag.contains_task(&task.id) {
                return Err(Error::Validation(format!("duplicate task id {}", task.id)));
            }
            dag.add_task(task.clone());
        }
        for task in tasks {
            for dep in &task.dependencies {
                dag.add_dependency(dep, &task.id)?;
            }
        }
        Ok(dag)
    }

    /// Add a task. Returns the existing index if the id is already present.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }
        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Record that `from` must complete before `to` can start.
    ///
    /// # Errors
    /// Returns an error if either task is unknown or the edge would close a cycle.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = *self.task_index.get(from).ok_or_else(|| {
            Error::Validation(format!("task {} depends on unknown task {}", to, from))
        })?;
        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", to)))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "dependency from {} to {} would create a cycle",
                from, to
            )));
        }
        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
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

    /// Tasks ordered so each follows all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let title = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.title.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at task: {}", title))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Group tasks into topological batches.
    ///
    /// A root sits at level 0; every other task sits one level above its
    /// deepest dependency. Within a level, tasks keep insertion order.
    pub fn levels(&self) -> Result<Vec<Vec<&Task>>> {
        let order = toposort(&self.graph, None)
            .map_err(|_| Error::Validation("Cycle detected while computing levels".to_string()))?;

        let mut level_of: HashMap<NodeIndex, usize> = HashMap::new();
        for index in order {
            let level = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter_map(|dep| level_of.get(&dep))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(index, level);
        }

        let depth = level_of.values().copied().max().map_or(0, |m| m + 1);
        let mut levels: Vec<Vec<&Task>> = vec![Vec::new(); depth];
        for index in self.graph.node_indices() {
            if let (Some(&level), Some(task)) = (level_of.get(&index), self.graph.node_weight(index)) {
                levels[level].push(task);
            }
        }
        Ok(levels)
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
