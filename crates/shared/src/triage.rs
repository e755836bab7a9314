use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::domain::{Task, TaskStatus, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Overdue,
    Urgent,
    High,
    Normal,
}

pub fn is_overdue(task: &Task, now: DateTime<Utc>) -> bool {
    match task.due_date {
        Some(due) => task.status != TaskStatus::Completed && due < now,
        None => false,
    }
}

/// Days until due are rounded up, so anything due later today is 1 day out.
pub fn priority(task: &Task, now: DateTime<Utc>) -> Priority {
    let Some(due) = task.due_date else {
        return Priority::Normal;
    };
    let millis = (due - now).num_milliseconds();
    let days = millis.div_euclid(86_400_000) + i64::from(millis.rem_euclid(86_400_000) != 0);
    if days < 0 {
        Priority::Overdue
    } else if days <= 1 {
        Priority::Urgent
    } else if days <= 3 {
        Priority::High
    } else {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    CreatedAt,
    DueDate,
    Title,
    Status,
    Priority,
}

pub fn sort_tasks(tasks: &[Task], key: SortKey, now: DateTime<Utc>) -> Vec<Task> {
    let mut sorted = tasks.to_vec();
    sorted.sort_by(|a, b| match key {
        SortKey::CreatedAt => b.created_at.cmp(&a.created_at),
        SortKey::DueDate => match (a.due_date, b.due_date) {
            (Some(x), Some(y)) => x.cmp(&y),
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (None, None) => Ordering::Equal,
        },
        SortKey::Title => a.title.cmp(&b.title),
        SortKey::Status => a.status.cmp(&b.status),
        SortKey::Priority => priority(a, now).cmp(&priority(b, now)),
    });
    sorted
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assignee: Option<UserId>,
    pub search: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if self.status.is_some_and(|status| status != task.status) {
            return false;
        }
        if let Some(assignee) = &self.assignee {
            let assigned = task.assigned_to.as_ref().map(|a| a.user_id());
            if assigned != Some(assignee) {
                return false;
            }
        }
        if let Some(needle) = self.search.as_deref().map(str::to_lowercase) {
            return task.title.to_lowercase().contains(&needle)
                || task.description.to_lowercase().contains(&needle);
        }
        true
    }
}

pub fn filter_tasks<'a>(tasks: &'a [Task], filter: &TaskFilter) -> Vec<&'a Task> {
    tasks.iter().filter(|task| filter.matches(task)).collect()
}

/// Completed share in percent, rounded.
pub fn progress(tasks: &[Task]) -> u8 {
    if tasks.is_empty() {
        return 0;
    }
    let completed = tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Completed)
        .count();
    ((completed as f64 / tasks.len() as f64) * 100.0).round() as u8
}
