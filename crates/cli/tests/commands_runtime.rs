use std::env;
use std::sync::{Mutex, OnceLock};

use serde_json::Value;
use switchboard_cli::commands::{config, doctor, migrate};

const LOCAL_ENV: &[(&str, &str)] =
    &[("SWITCHBOARD_DATABASE_URL", "sqlite::memory:"), ("SWITCHBOARD_KV_MODE", "local")];

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(LOCAL_ENV, || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("SWITCHBOARD_DATABASE_URL", "postgres://localhost/switchboard")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn doctor_json_reports_each_check() {
    with_env(LOCAL_ENV, || {
        let result = doctor::run(true);
        let payload = parse_payload(&result.output);

        let names: Vec<&str> = payload["checks"]
            .as_array()
            .expect("checks array")
            .iter()
            .filter_map(|check| check["name"].as_str())
            .collect();
        assert_eq!(names, vec!["config_validation", "database_connectivity", "kv_connectivity"]);
        assert_eq!(payload["checks"][0]["status"], "pass");
        assert_eq!(payload["checks"][2]["status"], "pass");
        // A fresh in-memory database has no schema until migrated.
        assert_eq!(payload["checks"][1]["status"], "fail");
        assert_eq!(result.exit_code, 1);
    });
}

#[test]
fn doctor_skips_store_checks_when_config_is_invalid() {
    with_env(&[("SWITCHBOARD_OAUTH_TOKEN_URL", "not-a-url")], || {
        let result = doctor::run(false);

        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("[fail] config_validation"));
        assert!(result.output.contains("[skip] database_connectivity"));
        assert!(result.output.contains("[skip] kv_connectivity"));
    });
}

#[test]
fn config_redacts_secrets_and_attributes_env_sources() {
    with_env(
        &[
            ("SWITCHBOARD_DATABASE_URL", "sqlite::memory:"),
            ("SWITCHBOARD_KV_URL", "redis://:hunter2@cache:6379/0"),
            ("SWITCHBOARD_OAUTH_CLIENT_ID", "app.42"),
            ("SWITCHBOARD_OAUTH_CLIENT_SECRET", "super-secret"),
        ],
        || {
            let output = config::run();

            assert!(!output.contains("super-secret"));
            assert!(!output.contains("hunter2"));
            assert!(output.contains("- oauth.client_secret = <redacted> (source: env (SWITCHBOARD_OAUTH_CLIENT_SECRET))"));
            assert!(output.contains("- oauth.client_id = app.42"));
            assert!(output.contains("- kv.url = redis://:***@cache:6379/0"));
            assert!(output.contains("- session.idle_ttl_secs = 1800 (source: default)"));
        },
    );
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "SWITCHBOARD_DATABASE_URL",
        "SWITCHBOARD_DATABASE_MAX_CONNECTIONS",
        "SWITCHBOARD_DATABASE_TIMEOUT_SECS",
        "SWITCHBOARD_DATABASE_COLLECTION_PREFIX",
        "SWITCHBOARD_KV_MODE",
        "SWITCHBOARD_KV_URL",
        "SWITCHBOARD_KV_FALLBACK_TO_LOCAL",
        "SWITCHBOARD_OAUTH_TOKEN_URL",
        "SWITCHBOARD_OAUTH_CLIENT_ID",
        "SWITCHBOARD_OAUTH_CLIENT_SECRET",
        "SWITCHBOARD_OAUTH_SAFETY_MARGIN_SECS",
        "SWITCHBOARD_SESSION_IDLE_TTL_SECS",
        "SWITCHBOARD_SESSION_LOCK_WAIT_SECS",
        "SWITCHBOARD_CRM_BASE_URL",
        "SWITCHBOARD_SERVER_BIND_ADDRESS",
        "SWITCHBOARD_SERVER_HEALTH_CHECK_PORT",
        "SWITCHBOARD_LOGGING_LEVEL",
        "SWITCHBOARD_LOGGING_FORMAT",
        "SWITCHBOARD_LOG_LEVEL",
        "SWITCHBOARD_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
