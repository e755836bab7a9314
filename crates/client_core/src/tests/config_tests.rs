use std::{
    collections::HashMap,
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

use super::*;

fn no_env(_: &str) -> Option<String> {
    None
}

fn temp_config(contents: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = env::temp_dir().join(format!("planner_config_test_{suffix}"));
    fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("planner.toml");
    fs::write(&path, contents).expect("write config");
    path
}

#[test]
fn missing_file_yields_defaults() {
    let settings = load_settings_with(Path::new("/nonexistent/planner.toml"), no_env);
    assert_eq!(settings, Settings::default());
}

#[test]
fn file_values_override_defaults() {
    let path = temp_config(
        r#"
api_url = "https://planner.example.com/api"
reconnect_attempts = 2
rollback = "refetch"
refetch_on_reconnect = false
"#,
    );
    let settings = load_settings_with(&path, no_env);

    assert_eq!(settings.api_url, "https://planner.example.com/api");
    assert_eq!(settings.reconnect_attempts, 2);
    assert_eq!(settings.reconnect_delay_ms, 1000);
    assert_eq!(settings.rollback, RollbackPolicy::Refetch);
    assert!(!settings.refetch_on_reconnect);

    fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
}

#[test]
fn env_overrides_file_and_ignores_garbage() {
    let path = temp_config("reconnect_delay_ms = 250\n");
    let vars: HashMap<&str, &str> = HashMap::from([
        ("PLANNER__RECONNECT_DELAY_MS", "40"),
        ("PLANNER__RECONNECT_ATTEMPTS", "many"),
        ("PLANNER__ROLLBACK", "Refetch"),
    ]);
    let settings = load_settings_with(&path, |key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(settings.reconnect_delay_ms, 40);
    assert_eq!(settings.reconnect_attempts, 5);
    assert_eq!(settings.rollback, RollbackPolicy::Refetch);

    fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
}

#[test]
fn malformed_file_is_ignored() {
    let path = temp_config("reconnect_attempts = \"five\"\n");
    let settings = load_settings_with(&path, no_env);
    assert_eq!(settings.reconnect_attempts, 5);
    fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
}

#[test]
fn ws_url_is_derived_from_api_url() {
    let mut settings = Settings::default();
    assert_eq!(
        settings.resolved_ws_url().expect("derive"),
        "ws://localhost:8080/ws"
    );

    settings.api_url = "https://planner.example.com/api/".into();
    assert_eq!(
        settings.resolved_ws_url().expect("derive"),
        "wss://planner.example.com/ws"
    );

    settings.ws_url = Some("wss://push.example.com/socket".into());
    assert_eq!(
        settings.resolved_ws_url().expect("explicit"),
        "wss://push.example.com/socket"
    );
}

#[test]
fn non_http_api_url_cannot_derive_ws_url() {
    let settings = Settings {
        api_url: "ftp://files.example.com/api".into(),
        ..Settings::default()
    };
    assert!(matches!(
        settings.resolved_ws_url(),
        Err(ChannelError::InvalidUrl { .. })
    ));
}
