//! Ordered task backlog embedded in the agent document.

use serde::{Deserialize, Serialize};

use crate::core::types::{Task, TaskStatus};

/// Tasks in creation order, addressable by id.
///
/// The backlog is small and read in full every cycle, so a vector with linear
/// lookup keeps the persisted form a plain JSON array.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskBacklog {
    tasks: Vec<Task>,
}

impl TaskBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.tasks.iter_mut()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// Append a task, rejecting duplicate ids.
    pub fn push(&mut self, task: Task) -> Result<(), String> {
        if self.get(&task.id).is_some() {
            return Err(format!("duplicate task id '{}'", task.id));
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|task| task.status == status).count()
    }
}

impl FromIterator<Task> for TaskBacklog {
    fn from_iter<I: IntoIterator<Item = Task>>(iter: I) -> Self {
        Self {
            tasks: iter.into_iter().collect(),
        }
    }
}
