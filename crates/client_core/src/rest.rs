use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{MemberSummary, NewTask, Project, ProjectId, Task, TaskId, TaskPatch},
    error::{ApiError, ErrorCode},
    protocol::{
        AuthResponse, CreateProjectRequest, LoginRequest, ProjectEnvelope, ProjectsEnvelope,
        RegisterRequest, TaskEnvelope, UpdateMembersRequest,
    },
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{config::Settings, error::ApiFailure};

/// The task routes the board depends on.
#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn list_tasks(&self, project_id: &ProjectId) -> Result<Vec<Task>, ApiFailure>;
    async fn create_task(&self, project_id: &ProjectId, fields: &NewTask)
        -> Result<Task, ApiFailure>;
    async fn update_task(&self, task_id: &TaskId, patch: &TaskPatch) -> Result<Task, ApiFailure>;
    async fn delete_task(&self, task_id: &TaskId) -> Result<(), ApiFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    /// A non-auth request came back 401; the session must be torn down.
    Expired,
}

#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub user: MemberSummary,
}

const AUTH_PATHS: [&str; 2] = ["/auth/login", "/auth/register"];

pub struct HttpApi {
    http: Client,
    base_url: String,
    token: RwLock<Option<String>>,
    signals: broadcast::Sender<SessionSignal>,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiFailure> {
        let http = Client::builder().timeout(timeout).build()?;
        let (signals, _) = broadcast::channel(16);
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
            signals,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Arc<Self>, ApiFailure> {
        Self::new(
            settings.api_url.clone(),
            Duration::from_secs(settings.request_timeout_secs),
        )
        .map(Arc::new)
    }

    pub fn set_token(&self, token: Option<String>) {
        *self
            .token
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = token;
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn session_signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, ApiFailure> {
        let body = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let response: AuthResponse = self.send_json(Method::POST, "/auth/login", Some(&body)).await?;
        self.set_token(Some(response.token.clone()));
        Ok(AuthSession {
            token: response.token,
            user: response.user,
        })
    }

    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, ApiFailure> {
        let body = RegisterRequest {
            name: name.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        };
        let response: AuthResponse = self
            .send_json(Method::POST, "/auth/register", Some(&body))
            .await?;
        self.set_token(Some(response.token.clone()));
        Ok(AuthSession {
            token: response.token,
            user: response.user,
        })
    }

    pub fn logout(&self) {
        self.set_token(None);
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, ApiFailure> {
        let envelope: ProjectsEnvelope = self.send_json(Method::GET, "/projects", None::<&()>).await?;
        Ok(envelope.projects)
    }

    pub async fn get_project(&self, project_id: &ProjectId) -> Result<Project, ApiFailure> {
        let envelope: ProjectEnvelope = self
            .send_json(Method::GET, &format!("/projects/{project_id}"), None::<&()>)
            .await?;
        Ok(envelope.project)
    }

    pub async fn create_project(&self, name: &str, description: &str) -> Result<Project, ApiFailure> {
        let body = CreateProjectRequest {
            name: name.trim().to_string(),
            description: description.trim().to_string(),
        };
        let envelope: ProjectEnvelope = self.send_json(Method::POST, "/projects", Some(&body)).await?;
        Ok(envelope.project)
    }

    /// Checks the email against the current member list before patching it.
    pub async fn add_member(&self, project_id: &ProjectId, email: &str) -> Result<Project, ApiFailure> {
        let project = self.get_project(project_id).await?;
        let members = project
            .emails_with_member(email)
            .map_err(|err| ApiFailure::Rejected(err.to_string()))?;
        self.patch_members(project_id, members).await
    }

    pub async fn remove_member(
        &self,
        project_id: &ProjectId,
        email: &str,
    ) -> Result<Project, ApiFailure> {
        let project = self.get_project(project_id).await?;
        let members = project
            .emails_without_member(email)
            .map_err(|err| ApiFailure::Rejected(err.to_string()))?;
        self.patch_members(project_id, members).await
    }

    async fn patch_members(
        &self,
        project_id: &ProjectId,
        members: Vec<String>,
    ) -> Result<Project, ApiFailure> {
        let envelope: ProjectEnvelope = self
            .send_json(
                Method::PATCH,
                &format!("/projects/{project_id}"),
                Some(&UpdateMembersRequest { members }),
            )
            .await?;
        Ok(envelope.project)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base_url));
        match self.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + Sync)>,
    ) -> Result<Response, ApiFailure> {
        let mut builder = self.request(method.clone(), path);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        debug!(%method, path, status = status.as_u16(), "api response");
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::UNAUTHORIZED && !AUTH_PATHS.contains(&path) {
            warn!(path, "request unauthorized; expiring session");
            self.set_token(None);
            let _ = self.signals.send(SessionSignal::Expired);
            return Err(ApiFailure::Unauthorized);
        }

        let fallback = ErrorCode::from_status(status.as_u16());
        let (code, message) = match response.json::<ApiError>().await {
            Ok(body) if !body.message.is_empty() => {
                (body.code.unwrap_or(fallback), body.message)
            }
            Ok(body) => (body.code.unwrap_or(fallback), default_reason(status)),
            Err(_) => (fallback, default_reason(status)),
        };
        Err(ApiFailure::Status {
            status: status.as_u16(),
            code,
            message,
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + Sync)>,
    ) -> Result<T, ApiFailure> {
        let response = self.send(method, path, body).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| ApiFailure::Decode(err.to_string()))
    }
}

#[async_trait]
impl TaskApi for HttpApi {
    async fn list_tasks(&self, project_id: &ProjectId) -> Result<Vec<Task>, ApiFailure> {
        Ok(self.get_project(project_id).await?.tasks)
    }

    async fn create_task(
        &self,
        project_id: &ProjectId,
        fields: &NewTask,
    ) -> Result<Task, ApiFailure> {
        let envelope: TaskEnvelope = self
            .send_json(
                Method::POST,
                &format!("/projects/{project_id}/tasks"),
                Some(fields),
            )
            .await?;
        Ok(envelope.task)
    }

    async fn update_task(&self, task_id: &TaskId, patch: &TaskPatch) -> Result<Task, ApiFailure> {
        let envelope: TaskEnvelope = self
            .send_json(Method::PATCH, &format!("/tasks/{task_id}"), Some(patch))
            .await?;
        Ok(envelope.task)
    }

    async fn delete_task(&self, task_id: &TaskId) -> Result<(), ApiFailure> {
        self.send(Method::DELETE, &format!("/tasks/{task_id}"), None::<&()>)
            .await?;
        Ok(())
    }
}

fn default_reason(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
