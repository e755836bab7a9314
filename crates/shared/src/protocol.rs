use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{MemberSummary, Project, ProjectId, Task, TaskId};

/// Frames the client sends on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinProject { project_id: ProjectId },
    LeaveProject { project_id: ProjectId },
}

/// Inbound envelope before validation. The payload is kept untyped so a bad
/// frame can be reported precisely instead of failing as a whole.
#[derive(Debug, Clone, Deserialize)]
pub struct RawServerFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Created, EventKind::Updated, EventKind::Deleted];

    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::Created => "task_created",
            EventKind::Updated => "task_updated",
            EventKind::Deleted => "task_deleted",
        }
    }

    fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "task_created" | "taskCreated" => Some(EventKind::Created),
            "task_updated" | "taskUpdated" => Some(EventKind::Updated),
            "task_deleted" | "taskDeleted" => Some(EventKind::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardEvent {
    Created(Task),
    Updated(Task),
    Deleted { task_id: TaskId },
}

impl BoardEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BoardEvent::Created(_) => EventKind::Created,
            BoardEvent::Updated(_) => EventKind::Updated,
            BoardEvent::Deleted { .. } => EventKind::Deleted,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            BoardEvent::Created(task) | BoardEvent::Updated(task) => &task.id,
            BoardEvent::Deleted { task_id } => task_id,
        }
    }
}

/// A validated push event, tagged with the project room it was sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEvent {
    pub project_id: ProjectId,
    pub event: BoardEvent,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid frame: {0}")]
    Frame(#[source] serde_json::Error),
    #[error("unknown event kind: {0}")]
    UnknownKind(String),
    #[error("{kind} payload is missing the task identity")]
    MissingIdentity { kind: EventKind },
    #[error("{kind} payload is missing the project identity")]
    MissingProject { kind: EventKind },
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

pub fn parse_server_frame(text: &str) -> Result<RoomEvent, EventError> {
    let raw: RawServerFrame = serde_json::from_str(text).map_err(EventError::Frame)?;
    RoomEvent::try_from(raw)
}

impl TryFrom<RawServerFrame> for RoomEvent {
    type Error = EventError;

    fn try_from(raw: RawServerFrame) -> Result<Self, Self::Error> {
        let kind = EventKind::from_wire(&raw.kind).ok_or(EventError::UnknownKind(raw.kind))?;
        let payload = raw.payload;
        let declared_project = non_empty_str(&payload, &["project_id", "projectId"]);

        let event = match kind {
            EventKind::Created | EventKind::Updated => {
                // Accept either {"task": {...}} or the task object itself.
                let body = payload.get("task").unwrap_or(&payload);
                if non_empty_str(body, &["id", "_id"]).is_none() {
                    return Err(EventError::MissingIdentity { kind });
                }
                let task: Task = serde_json::from_value(body.clone())
                    .map_err(|source| EventError::Malformed { kind, source })?;
                if kind == EventKind::Created {
                    BoardEvent::Created(task)
                } else {
                    BoardEvent::Updated(task)
                }
            }
            EventKind::Deleted => {
                let task_id = non_empty_str(&payload, &["task_id", "taskId", "id", "_id"])
                    .ok_or(EventError::MissingIdentity { kind })?;
                BoardEvent::Deleted {
                    task_id: TaskId::new(task_id),
                }
            }
        };

        let project_id = declared_project
            .map(ProjectId::new)
            .or_else(|| match &event {
                BoardEvent::Created(task) | BoardEvent::Updated(task) => task.project_id.clone(),
                BoardEvent::Deleted { .. } => None,
            })
            .ok_or(EventError::MissingProject { kind })?;

        Ok(RoomEvent { project_id, event })
    }
}

fn non_empty_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
}

impl RoomEvent {
    /// Encodes the event in the same envelope the server uses.
    pub fn to_frame(&self) -> Value {
        let (kind, payload) = match &self.event {
            BoardEvent::Created(task) => (
                EventKind::Created,
                serde_json::json!({ "project_id": self.project_id, "task": task }),
            ),
            BoardEvent::Updated(task) => (
                EventKind::Updated,
                serde_json::json!({ "project_id": self.project_id, "task": task }),
            ),
            BoardEvent::Deleted { task_id } => (
                EventKind::Deleted,
                serde_json::json!({ "project_id": self.project_id, "task_id": task_id }),
            ),
        };
        serde_json::json!({ "type": kind.wire_name(), "payload": payload })
    }
}

// REST bodies. Responses from the backend wrap the resource in a named field.

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: MemberSummary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectEnvelope {
    pub project: Project,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectsEnvelope {
    #[serde(default)]
    pub projects: Vec<Project>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskEnvelope {
    pub task: Task,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateMembersRequest {
    pub members: Vec<String>,
}
