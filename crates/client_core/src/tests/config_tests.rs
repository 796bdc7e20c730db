use super::*;

use std::collections::HashMap;

#[test]
fn missing_file_keeps_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = load_settings(Some(&dir.path().join("absent.toml")));
    let defaults = ClientSettings::default();
    assert_eq!(settings.request_timeout, defaults.request_timeout);
    assert_eq!(settings.reconnect.max_attempts, defaults.reconnect.max_attempts);
}

#[test]
fn file_values_override_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("client.toml");
    fs::write(
        &path,
        r#"
api_base_url = "https://market.example"
realtime_url = "wss://market.example/realtime"
outbound_queue_capacity = 8

[reconnect]
enabled = false
initial_delay_ms = 50
"#,
    )
    .expect("write config");

    let mut settings = ClientSettings::default();
    let file_cfg: FileSettings =
        toml::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
    apply_file_settings(&mut settings, file_cfg);

    assert_eq!(settings.api_base_url, "https://market.example");
    assert_eq!(settings.realtime_url, "wss://market.example/realtime");
    assert_eq!(settings.outbound_queue_capacity, 8);
    assert!(!settings.reconnect.enabled);
    assert_eq!(settings.reconnect.initial_delay, Duration::from_millis(50));
    assert!(settings.validate().is_ok());
}

#[test]
fn env_overrides_win_and_ignore_garbage_numbers() {
    let vars: HashMap<&str, &str> = [
        ("APP__API_BASE_URL", "http://10.0.0.2:3000"),
        ("APP__REQUEST_TIMEOUT_SECS", "not-a-number"),
        ("APP__RECONNECT_MAX_ATTEMPTS", "2"),
    ]
    .into_iter()
    .collect();

    let mut settings = ClientSettings::default();
    apply_env_overrides(&mut settings, |key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(settings.api_base_url, "http://10.0.0.2:3000");
    assert_eq!(settings.request_timeout, Duration::from_secs(15));
    assert_eq!(settings.reconnect.max_attempts, 2);
}

#[test]
fn validate_rejects_wrong_schemes() {
    let settings = ClientSettings {
        realtime_url: "http://127.0.0.1:3000".into(),
        ..ClientSettings::default()
    };
    assert!(matches!(settings.validate(), Err(ChatError::Validation(_))));

    let settings = ClientSettings {
        api_base_url: "ftp://127.0.0.1".into(),
        ..ClientSettings::default()
    };
    assert!(matches!(settings.validate(), Err(ChatError::Validation(_))));
}

#[test]
fn reconnect_delay_doubles_and_caps() {
    let policy = ReconnectPolicy {
        enabled: true,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(700),
        max_attempts: 10,
    };
    assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
    assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(700));
    assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(700));
}
