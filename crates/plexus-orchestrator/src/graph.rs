use crate::types::{Dependency, Task, TaskId, TaskStatus};
use plexus_core::{PlexusError, PlexusResult};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// A directed acyclic graph of tasks keyed by id.
///
/// The graph owns its tasks. Structure (ids, dependencies) is fixed once
/// built; the executor only mutates per-run fields (status, result, error).
/// Serializes as the task list in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Task>", into = "Vec<Task>")]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a task list, rejecting duplicate ids.
    ///
    /// Does not validate dependencies; call [`TaskGraph::validate`] for that.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> PlexusResult<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task)?;
        }
        Ok(graph)
    }

    /// Add a task to the graph.
    pub fn add_task(&mut self, task: Task) -> PlexusResult<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(PlexusError::DuplicateId(task.id.to_string()));
        }
        self.order.push(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task ids in insertion order.
    pub fn ids(&self) -> &[TaskId] {
        &self.order
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Check that every dependency exists and the graph has no cycle.
    ///
    /// Must pass before a graph is cached or executed.
    pub fn validate(&self) -> PlexusResult<()> {
        for task in self.tasks() {
            for dep in &task.dependencies {
                if !self.tasks.contains_key(&dep.task_id) {
                    return Err(PlexusError::UnknownDependency {
                        task_id: task.id.to_string(),
                        dependency: dep.task_id.to_string(),
                    });
                }
            }
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(PlexusError::Cycle {
                path: cycle.into_iter().map(|id| id.to_string()).collect(),
            });
        }

        Ok(())
    }

    /// Depth-first search with recursion-stack marking. Returns the ids along
    /// the first cycle found, with the starting id repeated at the end.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut marks = HashMap::new();
        let mut stack = Vec::new();
        for id in &self.order {
            if let Some(cycle) = self.dfs_cycle(id, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        id: &'a TaskId,
        marks: &mut HashMap<&'a TaskId, Mark>,
        stack: &mut Vec<&'a TaskId>,
    ) -> Option<Vec<TaskId>> {
        match marks.get(id) {
            Some(Mark::InProgress) => {
                // back edge
                let start = stack.iter().position(|s| *s == id)?;
                let mut path: Vec<TaskId> = stack[start..].iter().map(|s| (*s).clone()).collect();
                path.push(id.clone());
                return Some(path);
            }
            Some(Mark::Done) => return None,
            None => {}
        }

        marks.insert(id, Mark::InProgress);
        stack.push(id);
        if let Some(task) = self.tasks.get(id) {
            for dep in &task.dependencies {
                if let Some(cycle) = self.dfs_cycle(&dep.task_id, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    /// Whether `dep` no longer holds its dependent back: the predecessor
    /// completed, or the edge is optional and the predecessor ended without a
    /// result.
    pub fn dependency_satisfied(&self, dep: &Dependency) -> bool {
        match self.status_of(dep.task_id.as_str()) {
            Some(TaskStatus::Completed) => true,
            Some(status) => dep.optional && status.is_unsuccessful(),
            None => false,
        }
    }

    /// Pending with every dependency satisfied.
    pub fn is_eligible(&self, task: &Task) -> bool {
        task.status == TaskStatus::Pending
            && task
                .dependencies
                .iter()
                .all(|dep| self.dependency_satisfied(dep))
    }

    /// All tasks that may start now, highest priority first, ties in
    /// insertion order.
    pub fn ready_set(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self.tasks().filter(|t| self.is_eligible(t)).collect();
        ready.sort_by_key(|t| Reverse(t.priority));
        ready
    }

    /// Reverse adjacency: task id -> ids of the tasks that depend on it.
    pub fn dependents_map(&self) -> HashMap<TaskId, Vec<TaskId>> {
        let mut map: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for task in self.tasks() {
            for dep in &task.dependencies {
                let entry = map.entry(dep.task_id.clone()).or_default();
                if !entry.contains(&task.id) {
                    entry.push(task.id.clone());
                }
            }
        }
        map
    }

    /// Deterministic linearization (Kahn's algorithm). Among tasks whose
    /// dependencies are all placed, higher priority goes first, then
    /// insertion order.
    pub fn topological_order(&self) -> PlexusResult<Vec<TaskId>> {
        let index: HashMap<&TaskId, usize> =
            self.order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        let dependents = self.dependents_map();

        let mut in_degree: HashMap<&TaskId, usize> = HashMap::new();
        for task in self.tasks() {
            let mut unique: Vec<&TaskId> = task.dependencies.iter().map(|d| &d.task_id).collect();
            unique.sort();
            unique.dedup();
            in_degree.insert(&task.id, unique.len());
        }

        let mut heap = BinaryHeap::new();
        for task in self.tasks() {
            if in_degree.get(&task.id) == Some(&0) {
                heap.push((task.priority, Reverse(index[&task.id]), &task.id));
            }
        }

        let mut sorted = Vec::with_capacity(self.len());
        while let Some((_, _, id)) = heap.pop() {
            sorted.push(id.clone());
            for dependent in dependents.get(id).into_iter().flatten() {
                let Some(degree) = in_degree.get_mut(dependent) else {
                    continue;
                };
                *degree -= 1;
                if *degree == 0 {
                    let task = &self.tasks[dependent];
                    heap.push((task.priority, Reverse(index[&task.id]), &task.id));
                }
            }
        }

        if sorted.len() != self.len() {
            self.validate()?;
            return Err(PlexusError::Cycle { path: Vec::new() });
        }
        Ok(sorted)
    }

    /// Reset every task to `Pending` and clear results.
    pub fn reset(&mut self) {
        for task in self.tasks.values_mut() {
            task.reset();
        }
    }

    /// Every task reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }
}

impl TryFrom<Vec<Task>> for TaskGraph {
    type Error = PlexusError;

    fn try_from(tasks: Vec<Task>) -> Result<Self, Self::Error> {
        TaskGraph::from_tasks(tasks)
    }
}

impl From<TaskGraph> for Vec<Task> {
    fn from(mut graph: TaskGraph) -> Self {
        graph
            .order
            .iter()
            .filter_map(|id| graph.tasks.remove(id))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<TaskId> {
        list.iter().map(|s| TaskId::from(*s)).collect()
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::new();
        assert!(graph.is_empty());
        assert!(graph.is_done());
        assert!(graph.ready_set().is_empty());
        assert!(graph.validate().is_ok());
        assert!(graph.topological_order().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut graph = TaskGraph::new();
        graph.add_task(Task::new("a", "noop")).unwrap();
        let err = graph.add_task(Task::new("a", "other")).unwrap_err();
        assert!(matches!(err, PlexusError::DuplicateId(ref id) if id == "a"));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_three_node_cycle_detected() {
        let graph = TaskGraph::from_tasks(vec![
            Task::new("a", "noop").depends_on("b"),
            Task::new("b", "noop").depends_on("c"),
            Task::new("c", "noop").depends_on("a"),
        ])
        .unwrap();

        match graph.validate() {
            Err(PlexusError::Cycle { path }) => {
                assert_eq!(path, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let graph = TaskGraph::from_tasks(vec![Task::new("a", "noop").depends_on("a")]).unwrap();
        assert!(matches!(graph.validate(), Err(PlexusError::Cycle { .. })));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let graph = TaskGraph::from_tasks(vec![Task::new("a", "noop").depends_on("ghost")]).unwrap();
        match graph.validate() {
            Err(PlexusError::UnknownDependency { task_id, dependency }) => {
                assert_eq!(task_id, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected unknown dependency, got {other:?}"),
        }
    }

    #[test]
    fn test_diamond_is_valid() {
        let graph = TaskGraph::from_tasks(vec![
            Task::new("root", "noop"),
            Task::new("left", "noop").depends_on("root"),
            Task::new("right", "noop").depends_on("root"),
            Task::new("join", "noop").depends_on("left").depends_on("right"),
        ])
        .unwrap();
        assert!(graph.validate().is_ok());
        assert_eq!(
            graph.topological_order().unwrap(),
            ids(&["root", "left", "right", "join"])
        );
    }

    #[test]
    fn test_ready_set_follows_dependencies() {
        let mut graph = TaskGraph::from_tasks(vec![
            Task::new("design", "noop"),
            Task::new("code", "noop").depends_on("design"),
            Task::new("test", "noop").depends_on("code"),
        ])
        .unwrap();

        let ready: Vec<&str> = graph.ready_set().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["design"]);

        graph.get_mut("design").unwrap().status = TaskStatus::Completed;
        let ready: Vec<&str> = graph.ready_set().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["code"]);

        graph.get_mut("code").unwrap().status = TaskStatus::Running;
        assert!(graph.ready_set().is_empty());
    }

    #[test]
    fn test_ready_set_orders_by_priority_then_insertion() {
        let graph = TaskGraph::from_tasks(vec![
            Task::new("low", "noop"),
            Task::new("high", "noop").with_priority(5),
            Task::new("low2", "noop"),
        ])
        .unwrap();
        let ready: Vec<&str> = graph.ready_set().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["high", "low", "low2"]);
    }

    #[test]
    fn test_optional_dependency_unblocks_on_failure() {
        let mut graph = TaskGraph::from_tasks(vec![
            Task::new("enrich", "noop"),
            Task::new("report", "noop").optionally_depends_on("enrich"),
            Task::new("publish", "noop").depends_on("enrich"),
        ])
        .unwrap();

        graph.get_mut("enrich").unwrap().status = TaskStatus::Failed;
        let ready: Vec<&str> = graph.ready_set().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["report"]);
    }

    #[test]
    fn test_topological_order_uses_priority_for_ties() {
        let graph = TaskGraph::from_tasks(vec![
            Task::new("a", "noop"),
            Task::new("b", "noop"),
            Task::new("c", "noop").with_priority(1),
            Task::new("d", "noop").depends_on("a").with_priority(9),
        ])
        .unwrap();
        // d becomes available only after a; c wins the initial tie on priority.
        assert_eq!(graph.topological_order().unwrap(), ids(&["c", "a", "d", "b"]));
    }

    #[test]
    fn test_dependents_map() {
        let graph = TaskGraph::from_tasks(vec![
            Task::new("a", "noop"),
            Task::new("b", "noop").depends_on("a"),
            Task::new("c", "noop").depends_on("a").depends_on("b"),
        ])
        .unwrap();
        let map = graph.dependents_map();
        assert_eq!(map["a"], ids(&["b", "c"]));
        assert_eq!(map["b"], ids(&["c"]));
        assert!(!map.contains_key("c"));
    }

    #[test]
    fn test_reset_restores_pending() {
        let mut graph = TaskGraph::from_tasks(vec![Task::new("a", "noop")]).unwrap();
        let task = graph.get_mut("a").unwrap();
        task.status = TaskStatus::Completed;
        task.result = Some(serde_json::json!("done"));
        assert!(graph.is_done());

        graph.reset();
        assert_eq!(graph.status_of("a"), Some(TaskStatus::Pending));
        assert!(graph.get("a").unwrap().result.is_none());
    }

    #[test]
    fn test_serialization_keeps_insertion_order() {
        let graph = TaskGraph::from_tasks(vec![
            Task::new("z", "noop"),
            Task::new("a", "noop").depends_on("z"),
        ])
        .unwrap();
        let json = serde_json::to_string(&graph).unwrap();
        let parsed: TaskGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, graph);
        assert_eq!(parsed.ids(), ids(&["z", "a"]).as_slice());
    }

    #[test]
    fn test_deserialization_rejects_duplicates() {
        let json = r#"[{"id":"a","name":"a","action":"noop"},{"id":"a","name":"a","action":"noop"}]"#;
        assert!(serde_json::from_str::<TaskGraph>(json).is_err());
    }
}
