//! Task registry: every task record ever spawned, terminal ones included.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::task::{Task, TaskId, TaskStatus};

/// In-memory registry of task records keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRegistry {
    tasks: BTreeMap<TaskId, Task>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from loaded records.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    /// Insert a new task. Ids are never reused.
    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::InvariantViolation(format!("task id {} already exists", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Get a task by ID.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Get a task by ID or fail with `TaskNotFound`.
    pub fn require(&self, id: &TaskId) -> Result<&Task> {
        self.tasks.get(id).ok_or_else(|| Error::TaskNotFound { id: id.to_string() })
    }

    /// Mutable lookup or `TaskNotFound`.
    pub fn require_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks.get_mut(id).ok_or_else(|| Error::TaskNotFound { id: id.to_string() })
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Iterate over all tasks.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks with the given status.
    pub fn with_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.tasks.values().filter(|t| t.status == status).collect()
    }

    /// Non-terminal tasks.
    pub fn live(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(|t| !t.status.is_terminal())
    }

    /// Dependencies of `task` that are not COMPLETED. Unknown ids count as open.
    pub fn open_blockers(&self, task: &Task) -> Vec<TaskId> {
        task.blocked_by
            .iter()
            .filter(|dep| self.tasks.get(*dep).map(|d| d.status) != Some(TaskStatus::Completed))
            .cloned()
            .collect()
    }

    /// Whether `task` is waiting on an incomplete dependency.
    pub fn is_dependency_blocked(&self, task: &Task) -> bool {
        !self.open_blockers(task).is_empty()
    }

    /// Tasks that list `id` in their `blocked_by`.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.blocked_by.contains(id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Whether `from` (transitively) depends on `target`.
    pub fn depends_on(&self, from: &TaskId, target: &TaskId) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from.clone()];
        while let Some(current) = stack.pop() {
            if &current == target {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(task) = self.tasks.get(&current) {
                stack.extend(task.blocked_by.iter().cloned());
            }
        }
        false
    }

    /// Get the number of tasks by status.
    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();

        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Active => counts.active += 1,
                TaskStatus::Paused => counts.paused += 1,
                TaskStatus::Blocked => counts.blocked += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }

        counts
    }

    /// All records, cloned, in id order.
    pub fn to_vec(&self) -> Vec<Task> {
        self.tasks.values().cloned().collect()
    }
}

/// Task counts by status.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskCounts {
    pub active: usize,
    pub paused: usize,
    pub blocked: usize,
    pub completed: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    /// Total non-terminal tasks.
    pub fn live(&self) -> usize {
        self.active + self.paused + self.blocked
    }

    /// Total terminal tasks.
    pub fn terminal(&self) -> usize {
        self.completed + self.cancelled
    }

    /// Total tasks.
    pub fn total(&self) -> usize {
        self.live() + self.terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn registry_with(titles: &[&str]) -> (TaskRegistry, Vec<TaskId>) {
        let now = Utc::now();
        let mut registry = TaskRegistry::new();
        let mut ids = Vec::new();
        for title in titles {
            let task = Task::new(*title, now);
            ids.push(task.id.clone());
            registry.insert(task).unwrap();
        }
        (registry, ids)
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let (mut registry, ids) = registry_with(&["a"]);
        let mut dup = Task::new("dup", Utc::now());
        dup.id = ids[0].clone();
        assert!(registry.insert(dup).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_require_unknown() {
        let (registry, _) = registry_with(&[]);
        let err = registry.require(&TaskId::from("task-missing")).unwrap_err();
        assert!(matches!(err, Error::TaskNotFound { .. }));
    }

    #[test]
    fn test_open_blockers() {
        let (mut registry, ids) = registry_with(&["blocker", "blocked"]);
        registry.require_mut(&ids[1]).unwrap().blocked_by.insert(ids[0].clone());

        let blocked = registry.get(&ids[1]).unwrap().clone();
        assert_eq!(registry.open_blockers(&blocked), vec![ids[0].clone()]);

        registry.require_mut(&ids[0]).unwrap().status = TaskStatus::Completed;
        assert!(!registry.is_dependency_blocked(&blocked));
    }

    #[test]
    fn test_unknown_dependency_counts_as_open() {
        let (mut registry, ids) = registry_with(&["orphan"]);
        registry
            .require_mut(&ids[0])
            .unwrap()
            .blocked_by
            .insert(TaskId::from("task-gone"));
        let task = registry.get(&ids[0]).unwrap().clone();
        assert!(registry.is_dependency_blocked(&task));
    }

    #[test]
    fn test_transitive_dependency() {
        let (mut registry, ids) = registry_with(&["a", "b", "c"]);
        registry.require_mut(&ids[0]).unwrap().blocked_by.insert(ids[1].clone());
        registry.require_mut(&ids[1]).unwrap().blocked_by.insert(ids[2].clone());

        assert!(registry.depends_on(&ids[0], &ids[2]));
        assert!(!registry.depends_on(&ids[2], &ids[0]));
        assert_eq!(registry.dependents_of(&ids[1]), vec![ids[0].clone()]);
    }

    #[test]
    fn test_counts() {
        let (mut registry, ids) = registry_with(&["a", "b", "c"]);
        registry.require_mut(&ids[0]).unwrap().status = TaskStatus::Active;
        registry.require_mut(&ids[2]).unwrap().status = TaskStatus::Completed;

        let counts = registry.counts();
        assert_eq!(counts.active, 1);
        assert_eq!(counts.paused, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.live(), 2);
        assert_eq!(counts.total(), 3);
    }
}
