use std::collections::{BTreeMap, HashMap};

use shared::domain::{ProjectId, Task, TaskId, TaskStatus};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BoardStore {
    project_id: ProjectId,
    tasks: HashMap<TaskId, Task>,
    columns: BTreeMap<TaskStatus, Vec<TaskId>>,
    revision: u64,
}

/// Read-only copy handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardSnapshot {
    pub project_id: ProjectId,
    pub columns: BTreeMap<TaskStatus, Vec<TaskId>>,
    pub tasks: HashMap<TaskId, Task>,
    pub revision: u64,
    pub connected: bool,
}

impl BoardSnapshot {
    pub fn column(&self, status: TaskStatus) -> &[TaskId] {
        self.columns.get(&status).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|task| task.status)
    }

    /// Tasks of one column in board order.
    pub fn column_tasks(&self, status: TaskStatus) -> Vec<&Task> {
        self.column(status)
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }
}

fn empty_columns() -> BTreeMap<TaskStatus, Vec<TaskId>> {
    TaskStatus::ALL
        .into_iter()
        .map(|status| (status, Vec::new()))
        .collect()
}

impl BoardStore {
    pub fn new(project_id: ProjectId) -> Self {
        Self {
            project_id,
            tasks: HashMap::new(),
            columns: empty_columns(),
            revision: 0,
        }
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    /// Number of mutations applied so far.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn column(&self, status: TaskStatus) -> &[TaskId] {
        self.columns.get(&status).map(Vec::as_slice).unwrap_or_default()
    }

    /// Full replace. Input order is kept within each column; a repeated
    /// identity keeps its last occurrence.
    pub fn set_all(&mut self, tasks: impl IntoIterator<Item = Task>) {
        self.tasks.clear();
        self.columns = empty_columns();
        for task in tasks {
            self.insert_or_replace(task);
        }
        self.revision += 1;
    }

    /// Insert if absent, replace if present. A status change moves the task
    /// to the end of its new column; otherwise its position is kept. Writing
    /// an identical copy leaves the revision alone.
    pub fn upsert(&mut self, task: Task) {
        if self.tasks.get(&task.id) == Some(&task) {
            debug!(task_id = %task.id, "upsert of identical task ignored");
            return;
        }
        self.insert_or_replace(task);
        self.revision += 1;
    }

    /// Returns the removed task; absent identities are a no-op.
    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        self.detach(id, task.status);
        self.revision += 1;
        Some(task)
    }

    pub fn snapshot(&self, connected: bool) -> BoardSnapshot {
        BoardSnapshot {
            project_id: self.project_id.clone(),
            columns: self.columns.clone(),
            tasks: self.tasks.clone(),
            revision: self.revision,
            connected,
        }
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        TaskStatus::ALL
            .into_iter()
            .flat_map(|status| self.column(status).iter())
            .filter_map(|id| self.tasks.get(id))
    }

    fn insert_or_replace(&mut self, task: Task) {
        let id = task.id.clone();
        let status = task.status;
        match self.tasks.insert(id.clone(), task) {
            Some(previous) if previous.status == status => {}
            Some(previous) => {
                self.detach(&id, previous.status);
                self.column_mut(status).push(id);
            }
            None => self.column_mut(status).push(id),
        }
    }

    fn detach(&mut self, id: &TaskId, status: TaskStatus) {
        self.column_mut(status).retain(|existing| existing != id);
    }

    fn column_mut(&mut self, status: TaskStatus) -> &mut Vec<TaskId> {
        self.columns.entry(status).or_default()
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
