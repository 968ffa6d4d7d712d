//! Tests for hierarchical configuration resolution

use super::test_utils::{env_lock, EnvGuard};
use crate::config::{parse_bool, resolve_paused, ServerSettings, WorkerConfig, WorkerOptions};

#[test]
fn test_code_defaults_apply_without_environment() {
    let _lock = env_lock();
    let config = WorkerConfig::resolve("cfg_defaults_worker", &WorkerOptions::default()).unwrap();

    assert_eq!(config.poll_interval_millis, 100);
    assert_eq!(config.thread_count, 1);
    assert_eq!(config.domain, None);
    assert_eq!(config.poll_timeout_millis, 100);
    assert!(config.lease_extend_enabled);
    assert!(!config.register_task_def);
    assert!(config.overwrite_task_def);
    assert!(!config.strict_schema);
    assert!(!config.worker_id.is_empty());
}

#[test]
fn test_worker_env_beats_global_env_beats_code_default() {
    let _lock = env_lock();
    let _env = EnvGuard::set(&[
        ("conductor.worker.cfg_tier_worker.poll_interval_millis", "25"),
        ("conductor.worker.all.poll_interval_millis", "250"),
        ("conductor.worker.all.thread_count", "7"),
    ]);

    let options = WorkerOptions {
        poll_interval_millis: 500,
        thread_count: 2,
        ..WorkerOptions::default()
    };
    let config = WorkerConfig::resolve("cfg_tier_worker", &options).unwrap();

    // Worker-specific env wins over both the global env and the code default.
    assert_eq!(config.poll_interval_millis, 25);
    // Global env wins over the code default when no worker-specific value is set.
    assert_eq!(config.thread_count, 7);
}

#[test]
fn test_code_default_used_for_unset_properties() {
    let _lock = env_lock();
    let options = WorkerOptions {
        domain: Some("eu-west".to_string()),
        worker_id: Some("custom-id".to_string()),
        ..WorkerOptions::default()
    };
    let config = WorkerConfig::resolve("cfg_code_default_worker", &options).unwrap();
    assert_eq!(config.domain.as_deref(), Some("eu-west"));
    assert_eq!(config.worker_id, "custom-id");
}

#[test]
fn test_zero_thread_count_is_rejected() {
    let _lock = env_lock();
    let options = WorkerOptions {
        thread_count: 0,
        ..WorkerOptions::default()
    };
    assert!(WorkerConfig::resolve("cfg_zero_threads_worker", &options).is_err());

    // The same applies when the zero arrives from the environment.
    let _env = EnvGuard::set(&[("conductor.worker.cfg_env_zero_worker.thread_count", "0")]);
    assert!(WorkerConfig::resolve("cfg_env_zero_worker", &WorkerOptions::default()).is_err());
}

#[test]
fn test_unparseable_values_fall_back_to_code_default() {
    let _lock = env_lock();
    let _env = EnvGuard::set(&[
        (
            "conductor.worker.cfg_garbage_worker.poll_interval_millis",
            "not-a-number",
        ),
        (
            "conductor.worker.cfg_garbage_worker.lease_extend_enabled",
            "maybe",
        ),
    ]);

    let config = WorkerConfig::resolve("cfg_garbage_worker", &WorkerOptions::default()).unwrap();
    assert_eq!(config.poll_interval_millis, 100);
    assert!(config.lease_extend_enabled);
}

#[test]
fn test_bool_parsing_accepted_forms() {
    for raw in ["true", "TRUE", "1", "yes", "Yes"] {
        assert_eq!(parse_bool(raw), Some(true), "{raw}");
    }
    for raw in ["false", "False", "0", "no", "NO"] {
        assert_eq!(parse_bool(raw), Some(false), "{raw}");
    }
    assert_eq!(parse_bool("2"), None);
    assert_eq!(parse_bool(""), None);
}

#[test]
fn test_paused_is_resolved_dynamically() {
    let _lock = env_lock();
    assert!(!resolve_paused("cfg_paused_worker"));

    {
        let _env = EnvGuard::set(&[("conductor.worker.cfg_paused_worker.paused", "true")]);
        assert!(resolve_paused("cfg_paused_worker"));
    }

    // Clearing the variable resumes without any restart.
    assert!(!resolve_paused("cfg_paused_worker"));
}

#[test]
fn test_server_settings_require_valid_url() {
    let _lock = env_lock();
    assert!(ServerSettings::new("http://localhost:8080/api").is_ok());
    assert!(ServerSettings::new("not a url").is_err());
    assert!(ServerSettings::new("ftp://example.com").is_err());
    assert!(ServerSettings::new("http://user:pw@example.com").is_err());
}

#[test]
fn test_server_settings_trim_trailing_slash() {
    let _lock = env_lock();
    let settings = ServerSettings::new("http://localhost:8080/api/").unwrap();
    assert_eq!(settings.base_url, "http://localhost:8080/api");
}

#[test]
fn test_server_settings_toggles_from_env() {
    let _lock = env_lock();

    let settings = ServerSettings::new("http://localhost:8080").unwrap();
    assert!(settings.http2_enabled);
    assert!(settings.update_v2_enabled);

    let _env = EnvGuard::set(&[
        ("CONDUCTOR_HTTP2_ENABLED", "false"),
        ("taskUpdateV2", "false"),
    ]);
    let settings = ServerSettings::new("http://localhost:8080").unwrap();
    assert!(!settings.http2_enabled);
    assert!(!settings.update_v2_enabled);
}

#[test]
fn test_server_settings_auth_must_be_paired() {
    let _lock = env_lock();
    let _env = EnvGuard::set(&[("CONDUCTOR_AUTH_KEY", "key-only")]);
    assert!(ServerSettings::new("http://localhost:8080").is_err());
}

#[test]
fn test_server_settings_from_env_requires_url() {
    let _lock = env_lock();
    std::env::remove_var("CONDUCTOR_SERVER_URL");
    assert!(ServerSettings::from_env().is_err());

    let _env = EnvGuard::set(&[("CONDUCTOR_SERVER_URL", "http://localhost:9090")]);
    let settings = ServerSettings::from_env().unwrap();
    assert_eq!(settings.base_url, "http://localhost:9090");
}
