use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use switchboard_core::{ClientCredentials, CoordinationError, Dependency, TenantId};
use tracing::warn;

const DEFAULT_EXPIRES_IN_SECS: i64 = 3_600;
const MAX_EXPIRES_IN_SECS: i64 = 10 * 365 * 86_400;

/// Result of one refresh-token exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct GrantedToken {
    pub access_token: String,
    /// `None` when the provider kept the previous refresh token.
    pub refresh_token: Option<String>,
    pub expires_in_secs: i64,
}

impl std::fmt::Debug for GrantedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantedToken")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("expires_in_secs", &self.expires_in_secs)
            .finish()
    }
}

/// The refresh leg of the OAuth flow.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(
        &self,
        tenant_id: &TenantId,
        credentials: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<GrantedToken, CoordinationError>;
}

pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    token_url: String,
}

impl HttpTokenEndpoint {
    pub fn new(token_url: impl Into<String>, timeout: Duration) -> Result<Self, CoordinationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| CoordinationError::unavailable(Dependency::TokenEndpoint, error))?;
        Ok(Self { client, token_url: token_url.into() })
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<Value>,
    error: Option<String>,
    error_description: Option<String>,
}

/// `None` when the provider sent a lifetime outside `1..=MAX_EXPIRES_IN_SECS`.
fn parse_expires_in(value: Option<&Value>) -> Option<i64> {
    let seconds = match value {
        Some(Value::Number(number)) => number.as_i64(),
        Some(Value::String(text)) => text.trim().parse().ok(),
        Some(Value::Null) | None => Some(DEFAULT_EXPIRES_IN_SECS),
        Some(_) => None,
    }?;
    (1..=MAX_EXPIRES_IN_SECS).contains(&seconds).then_some(seconds)
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn refresh(
        &self,
        tenant_id: &TenantId,
        credentials: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<GrantedToken, CoordinationError> {
        let exchange_error = |status: Option<u16>, message: String| {
            CoordinationError::CredentialExchange { tenant_id: tenant_id.clone(), status, message }
        };

        let response = self
            .client
            .post(&self.token_url)
            .query(&[
                ("grant_type", "refresh_token"),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|error| {
                let error = error.without_url();
                warn!(
                    event_name = "auth.token.exchange_failed",
                    tenant_id = %tenant_id,
                    error = %error,
                    "token endpoint request failed"
                );
                exchange_error(None, format!("token endpoint request failed: {error}"))
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<RefreshResponse>(&body).ok();

        if !status.is_success() {
            let detail = parsed
                .as_ref()
                .and_then(|payload| payload.error_description.clone().or(payload.error.clone()))
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            return Err(exchange_error(
                Some(status.as_u16()),
                format!("token endpoint returned {status}: {detail}"),
            ));
        }

        let payload = parsed.ok_or_else(|| {
            exchange_error(Some(status.as_u16()), "token endpoint returned a non-JSON body".to_string())
        })?;

        let access_token = payload.access_token.filter(|token| !token.trim().is_empty()).ok_or_else(|| {
            let detail = payload.error.clone().unwrap_or_else(|| "missing access_token".to_string());
            exchange_error(Some(status.as_u16()), format!("token endpoint returned no token: {detail}"))
        })?;

        let expires_in_secs = parse_expires_in(payload.expires_in.as_ref()).ok_or_else(|| {
            exchange_error(
                Some(status.as_u16()),
                format!("token endpoint returned an unusable expires_in: {:?}", payload.expires_in),
            )
        })?;

        Ok(GrantedToken {
            access_token,
            refresh_token: payload.refresh_token.filter(|token| !token.trim().is_empty()),
            expires_in_secs,
        })
    }
}
