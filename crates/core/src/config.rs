use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub kv: KvConfig,
    pub oauth: OAuthConfig,
    pub tenant_config: TenantConfigCacheConfig,
    pub session: SessionConfig,
    pub crm: CrmConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Source-of-record document database.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
    /// Prepended to every collection name, e.g. `test_` for test environments.
    pub collection_prefix: String,
}

#[derive(Clone, Debug)]
pub struct KvConfig {
    pub mode: KvMode,
    pub url: String,
    pub op_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub key_prefix: String,
    /// Run on the in-process store when Redis is unreachable at startup.
    pub fallback_to_local: bool,
}

#[derive(Clone, Debug)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub timeout_secs: u64,
    pub safety_margin_secs: u64,
}

#[derive(Clone, Debug)]
pub struct TenantConfigCacheConfig {
    pub cache_ttl_secs: u64,
    pub watch_interval_ms: u64,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub lock_lease_secs: u64,
    pub lock_wait_secs: u64,
    pub lock_poll_ms: u64,
    pub history_limit: usize,
    pub history_seed: usize,
    pub history_ttl_secs: u64,
    pub tenant_mapping_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    /// Overrides `https://{tenant}/rest/` when set.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvMode {
    Redis,
    Local,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub kv_mode: Option<KvMode>,
    pub kv_url: Option<String>,
    pub oauth_token_url: Option<String>,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub crm_base_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://switchboard.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
                collection_prefix: String::new(),
            },
            kv: KvConfig {
                mode: KvMode::Redis,
                url: "redis://127.0.0.1:6379/0".to_string(),
                op_timeout_ms: 2_000,
                connect_timeout_ms: 3_000,
                key_prefix: String::new(),
                fallback_to_local: false,
            },
            oauth: OAuthConfig {
                token_url: "https://oauth.bitrix.info/oauth/token/".to_string(),
                client_id: None,
                client_secret: None,
                timeout_secs: 30,
                safety_margin_secs: 300,
            },
            tenant_config: TenantConfigCacheConfig { cache_ttl_secs: 3_600, watch_interval_ms: 1_000 },
            session: SessionConfig {
                idle_ttl_secs: 30 * 60,
                sweep_interval_secs: 60,
                lock_lease_secs: 120,
                lock_wait_secs: 60,
                lock_poll_ms: 100,
                history_limit: 10,
                history_seed: 6,
                history_ttl_secs: 7 * 24 * 3_600,
                tenant_mapping_ttl_secs: 24 * 3_600,
            },
            crm: CrmConfig { base_url: None, timeout_secs: 30 },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for KvMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "local" => Ok(Self::Local),
            other => Err(ConfigError::Validation(format!(
                "unsupported kv mode `{other}` (expected redis|local)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("switchboard.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Client credentials configured for every tenant, if any.
    pub fn global_client_credentials(&self) -> Option<(String, String)> {
        match (&self.oauth.client_id, &self.oauth.client_secret) {
            (Some(id), Some(secret)) => Some((id.clone(), secret.expose_secret().to_string())),
            _ => None,
        }
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
            if let Some(collection_prefix) = database.collection_prefix {
                self.database.collection_prefix = collection_prefix;
            }
        }

        if let Some(kv) = patch.kv {
            if let Some(mode) = kv.mode {
                self.kv.mode = mode;
            }
            if let Some(url) = kv.url {
                self.kv.url = url;
            }
            if let Some(op_timeout_ms) = kv.op_timeout_ms {
                self.kv.op_timeout_ms = op_timeout_ms;
            }
            if let Some(connect_timeout_ms) = kv.connect_timeout_ms {
                self.kv.connect_timeout_ms = connect_timeout_ms;
            }
            if let Some(key_prefix) = kv.key_prefix {
                self.kv.key_prefix = key_prefix;
            }
            if let Some(fallback_to_local) = kv.fallback_to_local {
                self.kv.fallback_to_local = fallback_to_local;
            }
        }

        if let Some(oauth) = patch.oauth {
            if let Some(token_url) = oauth.token_url {
                self.oauth.token_url = token_url;
            }
            if let Some(client_id) = oauth.client_id {
                self.oauth.client_id = Some(client_id);
            }
            if let Some(oauth_client_secret_value) = oauth.client_secret {
                self.oauth.client_secret = Some(secret_value(oauth_client_secret_value));
            }
            if let Some(timeout_secs) = oauth.timeout_secs {
                self.oauth.timeout_secs = timeout_secs;
            }
            if let Some(safety_margin_secs) = oauth.safety_margin_secs {
                self.oauth.safety_margin_secs = safety_margin_secs;
            }
        }

        if let Some(tenant_config) = patch.tenant_config {
            if let Some(cache_ttl_secs) = tenant_config.cache_ttl_secs {
                self.tenant_config.cache_ttl_secs = cache_ttl_secs;
            }
            if let Some(watch_interval_ms) = tenant_config.watch_interval_ms {
                self.tenant_config.watch_interval_ms = watch_interval_ms;
            }
        }

        if let Some(session) = patch.session {
            if let Some(value) = session.idle_ttl_secs {
                self.session.idle_ttl_secs = value;
            }
            if let Some(value) = session.sweep_interval_secs {
                self.session.sweep_interval_secs = value;
            }
            if let Some(value) = session.lock_lease_secs {
                self.session.lock_lease_secs = value;
            }
            if let Some(value) = session.lock_wait_secs {
                self.session.lock_wait_secs = value;
            }
            if let Some(value) = session.lock_poll_ms {
                self.session.lock_poll_ms = value;
            }
            if let Some(value) = session.history_limit {
                self.session.history_limit = value;
            }
            if let Some(value) = session.history_seed {
                self.session.history_seed = value;
            }
            if let Some(value) = session.history_ttl_secs {
                self.session.history_ttl_secs = value;
            }
            if let Some(value) = session.tenant_mapping_ttl_secs {
                self.session.tenant_mapping_ttl_secs = value;
            }
        }

        if let Some(crm) = patch.crm {
            if let Some(base_url) = crm.base_url {
                self.crm.base_url = Some(base_url);
            }
            if let Some(timeout_secs) = crm.timeout_secs {
                self.crm.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("SWITCHBOARD_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("SWITCHBOARD_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("SWITCHBOARD_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("SWITCHBOARD_DATABASE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_DATABASE_COLLECTION_PREFIX") {
            self.database.collection_prefix = value;
        }

        if let Some(value) = read_env("SWITCHBOARD_KV_MODE") {
            self.kv.mode = value.parse()?;
        }
        if let Some(value) = read_env("SWITCHBOARD_KV_URL") {
            self.kv.url = value;
        }
        if let Some(value) = read_env("SWITCHBOARD_KV_OP_TIMEOUT_MS") {
            self.kv.op_timeout_ms = parse_u64("SWITCHBOARD_KV_OP_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_KV_CONNECT_TIMEOUT_MS") {
            self.kv.connect_timeout_ms = parse_u64("SWITCHBOARD_KV_CONNECT_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_KV_KEY_PREFIX") {
            self.kv.key_prefix = value;
        }
        if let Some(value) = read_env("SWITCHBOARD_KV_FALLBACK_TO_LOCAL") {
            self.kv.fallback_to_local = parse_bool("SWITCHBOARD_KV_FALLBACK_TO_LOCAL", &value)?;
        }

        if let Some(value) = read_env("SWITCHBOARD_OAUTH_TOKEN_URL") {
            self.oauth.token_url = value;
        }
        if let Some(value) = read_env("SWITCHBOARD_OAUTH_CLIENT_ID") {
            self.oauth.client_id = Some(value);
        }
        if let Some(value) = read_env("SWITCHBOARD_OAUTH_CLIENT_SECRET") {
            self.oauth.client_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("SWITCHBOARD_OAUTH_TIMEOUT_SECS") {
            self.oauth.timeout_secs = parse_u64("SWITCHBOARD_OAUTH_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_OAUTH_SAFETY_MARGIN_SECS") {
            self.oauth.safety_margin_secs =
                parse_u64("SWITCHBOARD_OAUTH_SAFETY_MARGIN_SECS", &value)?;
        }

        if let Some(value) = read_env("SWITCHBOARD_TENANT_CONFIG_CACHE_TTL_SECS") {
            self.tenant_config.cache_ttl_secs =
                parse_u64("SWITCHBOARD_TENANT_CONFIG_CACHE_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_TENANT_CONFIG_WATCH_INTERVAL_MS") {
            self.tenant_config.watch_interval_ms =
                parse_u64("SWITCHBOARD_TENANT_CONFIG_WATCH_INTERVAL_MS", &value)?;
        }

        if let Some(value) = read_env("SWITCHBOARD_SESSION_IDLE_TTL_SECS") {
            self.session.idle_ttl_secs = parse_u64("SWITCHBOARD_SESSION_IDLE_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_SESSION_LOCK_LEASE_SECS") {
            self.session.lock_lease_secs =
                parse_u64("SWITCHBOARD_SESSION_LOCK_LEASE_SECS", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_SESSION_LOCK_WAIT_SECS") {
            self.session.lock_wait_secs = parse_u64("SWITCHBOARD_SESSION_LOCK_WAIT_SECS", &value)?;
        }

        if let Some(value) = read_env("SWITCHBOARD_CRM_BASE_URL") {
            self.crm.base_url = Some(value);
        }
        if let Some(value) = read_env("SWITCHBOARD_CRM_TIMEOUT_SECS") {
            self.crm.timeout_secs = parse_u64("SWITCHBOARD_CRM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("SWITCHBOARD_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("SWITCHBOARD_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("SWITCHBOARD_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("SWITCHBOARD_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("SWITCHBOARD_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("SWITCHBOARD_LOGGING_LEVEL").or_else(|| read_env("SWITCHBOARD_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("SWITCHBOARD_LOGGING_FORMAT").or_else(|| read_env("SWITCHBOARD_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(kv_mode) = overrides.kv_mode {
            self.kv.mode = kv_mode;
        }
        if let Some(kv_url) = overrides.kv_url {
            self.kv.url = kv_url;
        }
        if let Some(token_url) = overrides.oauth_token_url {
            self.oauth.token_url = token_url;
        }
        if let Some(client_id) = overrides.oauth_client_id {
            self.oauth.client_id = Some(client_id);
        }
        if let Some(client_secret) = overrides.oauth_client_secret {
            self.oauth.client_secret = Some(secret_value(client_secret));
        }
        if let Some(base_url) = overrides.crm_base_url {
            self.crm.base_url = Some(base_url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_kv(&self.kv)?;
        validate_oauth(&self.oauth)?;
        validate_tenant_config(&self.tenant_config)?;
        validate_session(&self.session)?;
        validate_crm(&self.crm)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("switchboard.toml"), PathBuf::from("config/switchboard.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_kv(kv: &KvConfig) -> Result<(), ConfigError> {
    if kv.mode == KvMode::Redis {
        let url = kv.url.trim();
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ConfigError::Validation(
                "kv.url must start with redis:// or rediss:// when kv.mode is redis".to_string(),
            ));
        }
    }

    if kv.op_timeout_ms == 0 || kv.op_timeout_ms > 10_000 {
        return Err(ConfigError::Validation(
            "kv.op_timeout_ms must be in range 1..=10000".to_string(),
        ));
    }

    if kv.connect_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "kv.connect_timeout_ms must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_oauth(oauth: &OAuthConfig) -> Result<(), ConfigError> {
    if !is_http_url(oauth.token_url.trim()) {
        return Err(ConfigError::Validation(
            "oauth.token_url must start with http:// or https://".to_string(),
        ));
    }

    if oauth.client_id.is_some() != oauth.client_secret.is_some() {
        return Err(ConfigError::Validation(
            "oauth.client_id and oauth.client_secret must be configured together (or both omitted to use per-tenant secrets)"
                .to_string(),
        ));
    }

    if oauth.timeout_secs == 0 || oauth.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "oauth.timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    if oauth.safety_margin_secs >= 3_600 {
        return Err(ConfigError::Validation(
            "oauth.safety_margin_secs must be below 3600 (the usual token lifetime)".to_string(),
        ));
    }

    Ok(())
}

fn validate_tenant_config(tenant_config: &TenantConfigCacheConfig) -> Result<(), ConfigError> {
    if tenant_config.cache_ttl_secs == 0 || tenant_config.cache_ttl_secs > 86_400 {
        return Err(ConfigError::Validation(
            "tenant_config.cache_ttl_secs must be in range 1..=86400".to_string(),
        ));
    }

    if tenant_config.watch_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "tenant_config.watch_interval_ms must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_session(session: &SessionConfig) -> Result<(), ConfigError> {
    if session.idle_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "session.idle_ttl_secs must be greater than zero".to_string(),
        ));
    }

    if session.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "session.sweep_interval_secs must be greater than zero".to_string(),
        ));
    }

    if session.lock_lease_secs == 0 || session.lock_lease_secs > 3_600 {
        return Err(ConfigError::Validation(
            "session.lock_lease_secs must be in range 1..=3600 so crashed holders expire"
                .to_string(),
        ));
    }

    if session.lock_wait_secs == 0 || session.lock_wait_secs > 300 {
        return Err(ConfigError::Validation(
            "session.lock_wait_secs must be in range 1..=300".to_string(),
        ));
    }

    if session.lock_poll_ms == 0 || session.lock_poll_ms > 10_000 {
        return Err(ConfigError::Validation(
            "session.lock_poll_ms must be in range 1..=10000".to_string(),
        ));
    }

    if session.history_limit == 0 || session.history_seed > session.history_limit {
        return Err(ConfigError::Validation(
            "session.history_limit must be positive and at least session.history_seed".to_string(),
        ));
    }

    Ok(())
}

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    if let Some(base_url) = &crm.base_url {
        if !is_http_url(base_url) {
            return Err(ConfigError::Validation(
                "crm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    if crm.timeout_secs == 0 || crm.timeout_secs > 300 {
        return Err(ConfigError::Validation("crm.timeout_secs must be in range 1..=300".to_string()));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    kv: Option<KvPatch>,
    oauth: Option<OAuthPatch>,
    tenant_config: Option<TenantConfigPatch>,
    session: Option<SessionPatch>,
    crm: Option<CrmPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
    collection_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KvPatch {
    mode: Option<KvMode>,
    url: Option<String>,
    op_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    key_prefix: Option<String>,
    fallback_to_local: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct OAuthPatch {
    token_url: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    timeout_secs: Option<u64>,
    safety_margin_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TenantConfigPatch {
    cache_ttl_secs: Option<u64>,
    watch_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionPatch {
    idle_ttl_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    lock_lease_secs: Option<u64>,
    lock_wait_secs: Option<u64>,
    lock_poll_ms: Option<u64>,
    history_limit: Option<usize>,
    history_seed: Option<usize>,
    history_ttl_secs: Option<u64>,
    tenant_mapping_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
