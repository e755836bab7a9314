use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(TaskId);
id_newtype!(ProjectId);
id_newtype!(UserId);

const PROVISIONAL_PREFIX: &str = "local-";

impl TaskId {
    /// Client-side placeholder identity for a task whose create call has not
    /// been confirmed yet. The server never issues ids with this prefix.
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[serde(alias = "To Do")]
    Todo,
    #[serde(alias = "In Progress")]
    InProgress,
    #[serde(alias = "Completed")]
    Completed,
}

impl TaskStatus {
    /// Board column order, left to right.
    pub const ALL: [TaskStatus; 3] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "inprogress",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Todo => "To Do",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::Completed => "Completed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "todo" | "to do" => Ok(TaskStatus::Todo),
            "inprogress" | "in progress" | "in-progress" => Ok(TaskStatus::InProgress),
            "completed" | "done" => Ok(TaskStatus::Completed),
            _ => Err(UnknownStatus(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    #[serde(alias = "_id")]
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// Assignee as sent by the server: either a populated member or a bare id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Assignee {
    Member(MemberSummary),
    Id(UserId),
}

impl Assignee {
    pub fn user_id(&self) -> &UserId {
        match self {
            Assignee::Member(member) => &member.id,
            Assignee::Id(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(alias = "_id")]
    pub id: TaskId,
    #[serde(default, alias = "project", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, alias = "assignedTo", skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<Assignee>,
    #[serde(default, alias = "dueDate", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the user when creating a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            status,
            assigned_to: None,
            due_date: None,
        }
    }

    /// Local stand-in shown while the create call is in flight.
    pub fn provisional_task(&self, project_id: &ProjectId, now: DateTime<Utc>) -> Task {
        Task {
            id: TaskId::provisional(),
            project_id: Some(project_id.clone()),
            title: self.title.clone(),
            description: self.description.clone(),
            status: self.status,
            assigned_to: self.assigned_to.clone().map(Assignee::Id),
            due_date: self.due_date,
            created_at: now,
        }
    }
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.assigned_to.is_none()
            && self.due_date.is_none()
    }

    pub fn apply_to(&self, task: &Task) -> Task {
        let mut next = task.clone();
        if let Some(title) = &self.title {
            next.title = title.clone();
        }
        if let Some(description) = &self.description {
            next.description = description.clone();
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(assignee) = &self.assigned_to {
            next.assigned_to = Some(Assignee::Id(assignee.clone()));
        }
        if let Some(due_date) = self.due_date {
            next.due_date = Some(due_date);
        }
        next
    }
}

pub const TITLE_MIN_CHARS: usize = 3;
pub const TITLE_MAX_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TitleError {
    #[error("task title is required")]
    Empty,
    #[error("title must be at least 3 characters")]
    TooShort,
    #[error("title must not exceed 100 characters")]
    TooLong,
}

pub fn validate_title(raw: &str) -> Result<String, TitleError> {
    let title = raw.trim();
    let len = title.chars().count();
    if len == 0 {
        Err(TitleError::Empty)
    } else if len < TITLE_MIN_CHARS {
        Err(TitleError::TooShort)
    } else if len > TITLE_MAX_CHARS {
        Err(TitleError::TooLong)
    } else {
        Ok(title.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    #[serde(alias = "_id")]
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub owner: MemberSummary,
    #[serde(default)]
    pub members: Vec<MemberSummary>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MembershipError {
    #[error("please enter a valid email address")]
    InvalidEmail,
    #[error("this user is already a member")]
    AlreadyMember,
    #[error("owner is already part of the project")]
    IsOwner,
    #[error("no member with email {0}")]
    NotAMember(String),
}

impl Project {
    /// Owner first, then members. The owner is never duplicated even if the
    /// server lists them among the members.
    pub fn people(&self) -> Vec<&MemberSummary> {
        let mut people = vec![&self.owner];
        people.extend(self.members.iter().filter(|m| m.id != self.owner.id));
        people
    }

    pub fn member_emails(&self) -> Vec<String> {
        self.members.iter().map(|m| m.email.clone()).collect()
    }

    /// Member email list to send when adding `email`.
    pub fn emails_with_member(&self, email: &str) -> Result<Vec<String>, MembershipError> {
        let email = email.trim();
        if !looks_like_email(email) {
            return Err(MembershipError::InvalidEmail);
        }
        if self.owner.email.eq_ignore_ascii_case(email) {
            return Err(MembershipError::IsOwner);
        }
        if self
            .members
            .iter()
            .any(|m| m.email.eq_ignore_ascii_case(email))
        {
            return Err(MembershipError::AlreadyMember);
        }
        let mut emails = self.member_emails();
        emails.push(email.to_string());
        Ok(emails)
    }

    /// Member email list to send when removing `email`.
    pub fn emails_without_member(&self, email: &str) -> Result<Vec<String>, MembershipError> {
        let email = email.trim();
        if !self
            .members
            .iter()
            .any(|m| m.email.eq_ignore_ascii_case(email))
        {
            return Err(MembershipError::NotAMember(email.to_string()));
        }
        Ok(self
            .members
            .iter()
            .filter(|m| !m.email.eq_ignore_ascii_case(email))
            .map(|m| m.email.clone())
            .collect())
    }
}

fn looks_like_email(raw: &str) -> bool {
    if raw.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = raw.split_once('@') else {
        return false;
    };
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !local.is_empty() && !host.is_empty() && !tld.is_empty()
}
