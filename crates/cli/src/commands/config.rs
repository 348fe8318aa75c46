use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use switchboard_core::config::{AppConfig, LoadOptions};
use toml::Value;

use crate::commands::doctor::redact_url;

/// `(key path, rendered value, environment variable)` for one displayed field.
type Field = (&'static str, String, Option<&'static str>);

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_key) in fields(&config) {
        let source =
            field_source(key, env_key, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key, &value, source));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let client_secret = match &config.oauth.client_secret {
        Some(secret) => redact_secret(secret.expose_secret()),
        None => "<unset>".to_string(),
    };

    vec![
        ("database.url", config.database.url.clone(), Some("SWITCHBOARD_DATABASE_URL")),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            Some("SWITCHBOARD_DATABASE_MAX_CONNECTIONS"),
        ),
        (
            "database.collection_prefix",
            display_or_empty(&config.database.collection_prefix),
            Some("SWITCHBOARD_DATABASE_COLLECTION_PREFIX"),
        ),
        ("kv.mode", format!("{:?}", config.kv.mode), Some("SWITCHBOARD_KV_MODE")),
        ("kv.url", redact_url(&config.kv.url), Some("SWITCHBOARD_KV_URL")),
        (
            "kv.fallback_to_local",
            config.kv.fallback_to_local.to_string(),
            Some("SWITCHBOARD_KV_FALLBACK_TO_LOCAL"),
        ),
        ("oauth.token_url", config.oauth.token_url.clone(), Some("SWITCHBOARD_OAUTH_TOKEN_URL")),
        (
            "oauth.client_id",
            config.oauth.client_id.clone().unwrap_or_else(|| "<unset>".to_string()),
            Some("SWITCHBOARD_OAUTH_CLIENT_ID"),
        ),
        ("oauth.client_secret", client_secret, Some("SWITCHBOARD_OAUTH_CLIENT_SECRET")),
        (
            "oauth.safety_margin_secs",
            config.oauth.safety_margin_secs.to_string(),
            Some("SWITCHBOARD_OAUTH_SAFETY_MARGIN_SECS"),
        ),
        (
            "tenant_config.cache_ttl_secs",
            config.tenant_config.cache_ttl_secs.to_string(),
            Some("SWITCHBOARD_TENANT_CONFIG_CACHE_TTL_SECS"),
        ),
        (
            "session.idle_ttl_secs",
            config.session.idle_ttl_secs.to_string(),
            Some("SWITCHBOARD_SESSION_IDLE_TTL_SECS"),
        ),
        (
            "session.lock_lease_secs",
            config.session.lock_lease_secs.to_string(),
            Some("SWITCHBOARD_SESSION_LOCK_LEASE_SECS"),
        ),
        (
            "session.lock_wait_secs",
            config.session.lock_wait_secs.to_string(),
            Some("SWITCHBOARD_SESSION_LOCK_WAIT_SECS"),
        ),
        ("session.history_limit", config.session.history_limit.to_string(), None),
        (
            "crm.base_url",
            config.crm.base_url.clone().unwrap_or_else(|| "<per-tenant domain>".to_string()),
            Some("SWITCHBOARD_CRM_BASE_URL"),
        ),
        (
            "server.bind_address",
            config.server.bind_address.clone(),
            Some("SWITCHBOARD_SERVER_BIND_ADDRESS"),
        ),
        (
            "server.health_check_port",
            config.server.health_check_port.to_string(),
            Some("SWITCHBOARD_SERVER_HEALTH_CHECK_PORT"),
        ),
        ("logging.level", config.logging.level.clone(), Some("SWITCHBOARD_LOGGING_LEVEL")),
        (
            "logging.format",
            format!("{:?}", config.logging.format),
            Some("SWITCHBOARD_LOGGING_FORMAT"),
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("switchboard.toml"), PathBuf::from("config/switchboard.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn display_or_empty(value: &str) -> String {
    if value.is_empty() {
        "<empty>".to_string()
    } else {
        value.to_string()
    }
}

fn redact_secret(secret: &str) -> String {
    if secret.trim().is_empty() {
        "<empty>".to_string()
    } else {
        "<redacted>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::contains_path;

    #[test]
    fn nested_key_paths_are_resolved() {
        let doc: toml::Value = "[kv]\nmode = \"local\"\n".parse().expect("toml");

        assert!(contains_path(&doc, "kv.mode"));
        assert!(!contains_path(&doc, "kv.url"));
        assert!(!contains_path(&doc, "oauth.token_url"));
    }
}
