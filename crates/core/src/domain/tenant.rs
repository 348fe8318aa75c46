use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// OAuth credentials for one tenant installation.
///
/// `expires_at` always describes `access_token`; a refresh replaces the
/// access token, refresh token and expiry together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantToken {
    pub tenant_id: TenantId,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub domain: String,
}

impl TenantToken {
    /// True when the access token stays valid for longer than `margin`.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expires_at
    }

    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }
}

impl fmt::Debug for TenantToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantToken")
            .field("tenant_id", &self.tenant_id)
            .field("access_token", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .field("domain", &self.domain)
            .finish()
    }
}

/// Client id and secret used for the refresh grant.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .finish()
    }
}

/// Merged per-tenant configuration. Values are opaque to the coordination
/// layer apart from the handful of typed accessors below.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub domain: String,
    pub values: Map<String, Value>,
}

impl TenantConfig {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str).filter(|value| !value.trim().is_empty())
    }

    pub fn provider(&self) -> Option<&str> {
        self.get_str("provider")
    }

    pub fn model(&self) -> Option<&str> {
        self.get_str("model")
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.get_str("systemPrompt")
    }

    pub fn role(&self) -> Option<&str> {
        self.get_str("role")
    }

    pub fn temperature(&self) -> Option<f64> {
        self.values.get("temperature").and_then(Value::as_f64)
    }

    pub fn client_credentials(&self) -> Option<ClientCredentials> {
        match (self.get_str("clientId"), self.get_str("clientSecret")) {
            (Some(client_id), Some(client_secret)) => Some(ClientCredentials {
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
            }),
            _ => None,
        }
    }
}

impl fmt::Debug for TenantConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&String> = self.values.keys().collect();
        f.debug_struct("TenantConfig").field("domain", &self.domain).field("keys", &keys).finish()
    }
}

/// Raw documents read from the source of record for one tenant.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigSources {
    pub installation: Option<Map<String, Value>>,
    pub settings: Option<Map<String, Value>>,
    pub agent: Option<Map<String, Value>>,
    pub secrets: Option<Map<String, Value>>,
}

const INSTALLATION_TOKEN_FIELDS: &[&str] = &["accessToken", "refreshToken", "expiresAt"];

/// Agent fields copied into the tenant config, with accepted aliases.
const AGENT_FIELDS: &[(&str, &[&str])] = &[
    ("role", &["role"]),
    ("systemPrompt", &["systemPrompt"]),
    ("model", &["model"]),
    ("temperature", &["temperature"]),
    ("provider", &["provider"]),
    ("openaiApiKey", &["openaiApiKey", "openai_api_key"]),
    ("googleApiKey", &["googleApiKey", "google_api_key"]),
];

/// Merges tenant documents by fixed precedence, most specific last:
/// shared settings, installation metadata, active agent, tenant secrets.
pub fn merge_tenant_config(tenant_id: &TenantId, sources: ConfigSources) -> TenantConfig {
    let mut values = Map::new();

    if let Some(settings) = sources.settings {
        extend_non_null(&mut values, settings);
    }

    let mut domain = None;
    if let Some(mut installation) = sources.installation {
        for field in INSTALLATION_TOKEN_FIELDS {
            installation.remove(*field);
        }
        domain = installation
            .get("domain")
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .map(str::to_string);
        extend_non_null(&mut values, installation);
    }

    if let Some(agent) = sources.agent {
        for (target, aliases) in AGENT_FIELDS {
            let value = aliases.iter().filter_map(|alias| agent.get(*alias)).find(|v| !v.is_null());
            if let Some(value) = value {
                values.insert((*target).to_string(), value.clone());
            }
        }
    }

    if let Some(secrets) = sources.secrets {
        extend_non_null(&mut values, secrets);
    }

    values.remove("domain");
    TenantConfig { domain: domain.unwrap_or_else(|| tenant_id.0.clone()), values }
}

fn extend_non_null(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        if !value.is_null() {
            target.insert(key, value);
        }
    }
}
