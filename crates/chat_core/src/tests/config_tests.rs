use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

#[test]
fn derives_secure_websocket_url_from_https_base() {
    let settings = ClientSettings {
        base_url: "https://chat.example.com/".into(),
        ..ClientSettings::default()
    };
    assert_eq!(
        settings.websocket_url().expect("ws url").as_str(),
        "wss://chat.example.com/connect"
    );
}

#[test]
fn rejects_base_url_without_http_scheme() {
    let settings = ClientSettings {
        base_url: "chat.example.com".into(),
        ..ClientSettings::default()
    };
    assert!(matches!(
        settings.websocket_url(),
        Err(ClientError::Config(_))
    ));
}

#[test]
fn silence_threshold_defaults_to_twice_the_health_interval() {
    let settings = ClientSettings {
        health_check_interval_secs: 20,
        ..ClientSettings::default()
    };
    assert_eq!(settings.silence_threshold(), Duration::from_secs(40));

    let tuned = ClientSettings {
        silence_threshold_secs: Some(5),
        ..settings
    };
    assert_eq!(tuned.silence_threshold(), Duration::from_secs(5));
}

#[test]
fn namespaced_env_vars_win_over_plain_names() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("CHAT_BASE_URL", "http://plain:1"),
        ("APP__BASE_URL", "http://namespaced:2"),
        ("CHAT_SILENCE_THRESHOLD_SECS", "12"),
        ("CHAT_BACKOFF_MAX_MS", "not-a-number"),
    ]);
    let mut settings = ClientSettings::default();
    apply_env_overrides(&mut settings, |key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(settings.base_url, "http://namespaced:2");
    assert_eq!(settings.silence_threshold_secs, Some(12));
    assert_eq!(settings.backoff_max_ms, ClientSettings::default().backoff_max_ms);
}

#[test]
fn partial_settings_file_keeps_defaults_for_missing_keys() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("chat_client_settings_{suffix}.toml"));
    fs::write(&path, "api_key = \"k1\"\nhealth_check_interval_secs = 15\n").expect("write");

    let settings = load_settings_file(&path).expect("load");
    assert_eq!(settings.api_key, "k1");
    assert_eq!(settings.health_check_interval_secs, 15);
    assert_eq!(settings.backoff_base_ms, 250);

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn missing_settings_file_yields_defaults() {
    let settings =
        load_settings_file(Path::new("/definitely/not/here/chat_client.toml")).expect("defaults");
    assert_eq!(settings, ClientSettings::default());
}
