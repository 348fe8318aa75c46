use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use switchboard_core::{ClientCredentials, CoordinationError, Dependency, TenantId, TenantToken};
use switchboard_store::{Collection, Document, KeyValueStore, SourceOfRecord, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::keys;
use crate::oauth::TokenEndpoint;

/// `expiresAt` values above this are milliseconds since the epoch.
const MILLIS_THRESHOLD: i64 = 10_000_000_000;

/// Per-tenant OAuth access tokens with a fast cache in the key-value store and
/// the installation record as the durable copy.
pub struct TokenManager {
    kv: Arc<dyn KeyValueStore>,
    records: Arc<dyn SourceOfRecord>,
    endpoint: Arc<dyn TokenEndpoint>,
    global_credentials: Option<ClientCredentials>,
    safety_margin: Duration,
    refresh_locks: StdMutex<HashMap<TenantId, Arc<Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        records: Arc<dyn SourceOfRecord>,
        endpoint: Arc<dyn TokenEndpoint>,
        global_credentials: Option<ClientCredentials>,
        safety_margin: Duration,
    ) -> Self {
        Self {
            kv,
            records,
            endpoint,
            global_credentials,
            safety_margin,
            refresh_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    /// Returns an access token valid for longer than the safety margin.
    pub async fn get_token(&self, tenant_id: &TenantId) -> Result<String, CoordinationError> {
        if let Some(token) = self.fresh_cached(tenant_id).await {
            debug!(event_name = "auth.token.cache_hit", tenant_id = %tenant_id);
            return Ok(token.access_token);
        }

        if let Some(token) = self.read_durable(tenant_id).await? {
            if token.is_fresh(Utc::now(), self.safety_margin) {
                debug!(event_name = "auth.token.durable_hit", tenant_id = %tenant_id);
                self.write_cache(&token).await;
                return Ok(token.access_token);
            }
        }

        let refresh_lock = self.refresh_lock(tenant_id);
        let _serialized = refresh_lock.lock().await;

        // Another caller may have refreshed while this one waited.
        if let Some(token) = self.fresh_cached(tenant_id).await {
            debug!(event_name = "auth.token.shared_refresh", tenant_id = %tenant_id);
            return Ok(token.access_token);
        }

        let token = self.refresh_locked(tenant_id).await?;
        Ok(token.access_token)
    }

    /// Exchanges the refresh token unconditionally and stores the result.
    pub async fn force_refresh(&self, tenant_id: &TenantId) -> Result<String, CoordinationError> {
        let refresh_lock = self.refresh_lock(tenant_id);
        let _serialized = refresh_lock.lock().await;

        let token = self.refresh_locked(tenant_id).await?;
        Ok(token.access_token)
    }

    fn refresh_lock(&self, tenant_id: &TenantId) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(tenant_id.clone()).or_default())
    }

    async fn refresh_locked(&self, tenant_id: &TenantId) -> Result<TenantToken, CoordinationError> {
        let current = self.latest_known(tenant_id).await?.ok_or_else(|| {
            CoordinationError::not_configured(tenant_id, "no installation record with a refresh token")
        })?;
        let credentials = self.client_credentials(tenant_id, &current.domain).await?;

        let granted = self.endpoint.refresh(tenant_id, &credentials, &current.refresh_token).await?;
        let now = Utc::now();
        let expires_at = Duration::try_seconds(granted.expires_in_secs)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| CoordinationError::CredentialExchange {
                tenant_id: tenant_id.clone(),
                status: None,
                message: format!("granted token lifetime {}s is out of range", granted.expires_in_secs),
            })?;
        let token = TenantToken {
            tenant_id: tenant_id.clone(),
            access_token: granted.access_token,
            refresh_token: granted.refresh_token.unwrap_or(current.refresh_token),
            expires_at,
            domain: current.domain,
        };

        if !token.is_fresh(now, self.safety_margin) {
            return Err(CoordinationError::CredentialExchange {
                tenant_id: tenant_id.clone(),
                status: None,
                message: format!(
                    "granted token expires in {}s, inside the {}s safety margin",
                    granted.expires_in_secs,
                    self.safety_margin.num_seconds()
                ),
            });
        }

        self.write_durable(&token).await;
        self.write_cache(&token).await;

        info!(
            event_name = "auth.token.refreshed",
            tenant_id = %tenant_id,
            expires_in_secs = granted.expires_in_secs,
            "access token refreshed"
        );
        Ok(token)
    }

    /// The newest token record from either tier; its refresh token is the one
    /// the provider expects next.
    async fn latest_known(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<TenantToken>, CoordinationError> {
        let cached = self.read_cache(tenant_id).await;
        let durable = match self.read_durable(tenant_id).await {
            Ok(durable) => durable,
            Err(error) if cached.is_some() => {
                warn!(
                    event_name = "auth.token.durable_read_failed",
                    tenant_id = %tenant_id,
                    error = %error,
                    "refreshing from the cached refresh token"
                );
                None
            }
            Err(error) => return Err(error),
        };

        let latest = match (cached, durable) {
            (Some(cached), Some(durable)) => {
                Some(if durable.expires_at > cached.expires_at { durable } else { cached })
            }
            (cached, durable) => cached.or(durable),
        };
        Ok(latest.filter(|token| !token.refresh_token.trim().is_empty()))
    }

    async fn client_credentials(
        &self,
        tenant_id: &TenantId,
        domain: &str,
    ) -> Result<ClientCredentials, CoordinationError> {
        if let Some(credentials) = &self.global_credentials {
            return Ok(credentials.clone());
        }

        let mut candidates = vec![tenant_id.as_str()];
        if domain != tenant_id.as_str() && !domain.is_empty() {
            candidates.push(domain);
        }

        for id in candidates {
            let secrets = self
                .records
                .get_document(Collection::Secrets, id)
                .await
                .map_err(|error| CoordinationError::unavailable(Dependency::SourceOfRecord, error))?;
            if let Some(credentials) = secrets.as_ref().and_then(credentials_from_document) {
                return Ok(credentials);
            }
        }

        Err(CoordinationError::not_configured(tenant_id, "no client credentials configured"))
    }

    async fn read_cache(&self, tenant_id: &TenantId) -> Option<TenantToken> {
        match self.kv.get(&keys::token(tenant_id)).await {
            Ok(Some(raw)) => match serde_json::from_str::<TenantToken>(&raw) {
                Ok(token) => Some(token),
                Err(error) => {
                    warn!(
                        event_name = "auth.token.cache_decode_failed",
                        tenant_id = %tenant_id,
                        error = %error,
                        "ignoring undecodable cached token"
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(
                    event_name = "auth.token.cache_read_failed",
                    tenant_id = %tenant_id,
                    error = %error,
                    "token cache unavailable; falling back to the installation record"
                );
                None
            }
        }
    }

    async fn fresh_cached(&self, tenant_id: &TenantId) -> Option<TenantToken> {
        self.read_cache(tenant_id)
            .await
            .filter(|token| token.is_fresh(Utc::now(), self.safety_margin))
    }

    async fn write_cache(&self, token: &TenantToken) {
        let raw = match serde_json::to_string(token) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(event_name = "auth.token.cache_encode_failed", error = %error);
                return;
            }
        };

        if let Err(error) = self.kv.set(&keys::token(&token.tenant_id), &raw, None).await {
            warn!(
                event_name = "auth.token.cache_write_failed",
                tenant_id = %token.tenant_id,
                error = %error,
                "token cache write failed"
            );
        }
    }

    async fn read_durable(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<TenantToken>, CoordinationError> {
        let document = self
            .records
            .get_document(Collection::Installations, tenant_id.as_str())
            .await
            .map_err(|error| CoordinationError::unavailable(Dependency::SourceOfRecord, error))?;
        Ok(document.map(|document| token_from_installation(tenant_id, &document)))
    }

    async fn write_durable(&self, token: &TenantToken) {
        let fields = installation_fields(token);
        let result = match self
            .records
            .update_document(Collection::Installations, token.tenant_id.as_str(), fields.clone())
            .await
        {
            Err(StoreError::NotFound { .. }) => {
                let mut document = fields;
                document.insert("domain".to_string(), Value::String(token.domain.clone()));
                self.records
                    .set_document(Collection::Installations, token.tenant_id.as_str(), document)
                    .await
            }
            other => other,
        };

        if let Err(store_error) = result {
            error!(
                event_name = "auth.token.persist_failed",
                tenant_id = %token.tenant_id,
                error = %store_error,
                "rotated token was not persisted durably; it is still served from the cache"
            );
        }
    }
}

fn credentials_from_document(document: &Document) -> Option<ClientCredentials> {
    let field = |name: &str| {
        document.get(name).and_then(Value::as_str).filter(|value| !value.trim().is_empty())
    };
    Some(ClientCredentials {
        client_id: field("clientId")?.to_string(),
        client_secret: field("clientSecret")?.to_string(),
    })
}

fn installation_fields(token: &TenantToken) -> Document {
    let fields = json!({
        "accessToken": token.access_token,
        "refreshToken": token.refresh_token,
        "expiresAt": token.expires_at.timestamp_millis(),
    });
    match fields {
        Value::Object(fields) => fields,
        _ => Document::new(),
    }
}

fn token_from_installation(tenant_id: &TenantId, document: &Document) -> TenantToken {
    let text = |name: &str| document.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
    let domain = Some(text("domain")).filter(|domain| !domain.is_empty());

    TenantToken {
        tenant_id: tenant_id.clone(),
        access_token: text("accessToken"),
        refresh_token: text("refreshToken"),
        expires_at: parse_expires_at(document.get("expiresAt")),
        domain: domain.unwrap_or_else(|| tenant_id.as_str().to_string()),
    }
}

/// Accepts milliseconds or seconds, as a number or numeric string. Anything
/// unreadable counts as already expired.
fn parse_expires_at(value: Option<&Value>) -> DateTime<Utc> {
    let raw = match value {
        Some(Value::Number(number)) => {
            number.as_i64().or_else(|| number.as_f64().map(|value| value as i64))
        }
        Some(Value::String(text)) => text.trim().parse::<i64>().ok(),
        _ => None,
    };

    let parsed = match raw {
        Some(raw) if raw > MILLIS_THRESHOLD => Utc.timestamp_millis_opt(raw).single(),
        Some(raw) => Utc.timestamp_opt(raw, 0).single(),
        None => None,
    };
    parsed.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
