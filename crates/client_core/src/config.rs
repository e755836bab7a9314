use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::error::ChannelError;

const DEFAULT_CONFIG_FILE: &str = "planner.toml";

/// How a rejected optimistic mutation is undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    /// Restore the pre-mutation copy of the task.
    #[default]
    Snapshot,
    /// Re-list the project's tasks from the server.
    Refetch,
}

impl FromStr for RollbackPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "snapshot" => Ok(RollbackPolicy::Snapshot),
            "refetch" => Ok(RollbackPolicy::Refetch),
            other => Err(format!("unknown rollback policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_url: String,
    pub ws_url: Option<String>,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub rollback: RollbackPolicy,
    pub refetch_on_reconnect: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/api".into(),
            ws_url: None,
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            request_timeout_secs: 15,
            rollback: RollbackPolicy::Snapshot,
            refetch_on_reconnect: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    ws_url: Option<String>,
    reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    rollback: Option<RollbackPolicy>,
    refetch_on_reconnect: Option<bool>,
}

impl Settings {
    /// Push channel endpoint. Without an explicit `ws_url` it is derived from
    /// the API url: same host, ws scheme, `/ws` path in place of `/api`.
    pub fn resolved_ws_url(&self) -> Result<String, ChannelError> {
        if let Some(ws_url) = &self.ws_url {
            return Ok(ws_url.clone());
        }
        derive_ws_url(&self.api_url)
    }

    fn apply_file(&mut self, file_cfg: FileSettings) {
        if let Some(v) = file_cfg.api_url {
            self.api_url = v;
        }
        if let Some(v) = file_cfg.ws_url {
            self.ws_url = Some(v);
        }
        if let Some(v) = file_cfg.reconnect_attempts {
            self.reconnect_attempts = v;
        }
        if let Some(v) = file_cfg.reconnect_delay_ms {
            self.reconnect_delay_ms = v;
        }
        if let Some(v) = file_cfg.request_timeout_secs {
            self.request_timeout_secs = v;
        }
        if let Some(v) = file_cfg.rollback {
            self.rollback = v;
        }
        if let Some(v) = file_cfg.refetch_on_reconnect {
            self.refetch_on_reconnect = v;
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("PLANNER__API_URL") {
            self.api_url = v;
        }
        if let Some(v) = env("PLANNER__WS_URL") {
            self.ws_url = Some(v);
        }
        parse_env(&env, "PLANNER__RECONNECT_ATTEMPTS", &mut self.reconnect_attempts);
        parse_env(&env, "PLANNER__RECONNECT_DELAY_MS", &mut self.reconnect_delay_ms);
        parse_env(&env, "PLANNER__REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs);
        parse_env(&env, "PLANNER__ROLLBACK", &mut self.rollback);
        parse_env(&env, "PLANNER__REFETCH_ON_RECONNECT", &mut self.refetch_on_reconnect);
    }
}

fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = env(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = %raw, "ignoring unparsable config override"),
    }
}

fn config_path() -> PathBuf {
    std::env::var("PLANNER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Defaults, then `planner.toml` (or `$PLANNER_CONFIG`), then `PLANNER__*`
/// environment variables.
pub fn load_settings() -> Settings {
    load_settings_with(&config_path(), |key| std::env::var(key).ok())
}

pub fn load_settings_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => settings.apply_file(file_cfg),
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "ignoring unreadable config file"
            ),
        }
    }

    settings.apply_env(env);
    settings
}

fn derive_ws_url(api_url: &str) -> Result<String, ChannelError> {
    let invalid = |reason: &str| ChannelError::InvalidUrl {
        url: api_url.to_string(),
        reason: reason.to_string(),
    };
    let mut url = Url::parse(api_url.trim()).map_err(|err| invalid(&err.to_string()))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return Err(invalid("api url must start with http:// or https://")),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch api url to a websocket scheme"))?;

    let path = url.path().trim_end_matches('/');
    let base = path.strip_suffix("/api").unwrap_or(path);
    let ws_path = format!("{base}/ws");
    url.set_path(&ws_path);
    url.set_query(None);
    Ok(url.to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
