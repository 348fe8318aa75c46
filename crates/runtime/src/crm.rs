use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Map, Value};
use switchboard_core::{CoordinationError, Dependency, TenantId};
use tracing::{debug, info, warn};

use crate::tenant_config::TenantConfigCache;
use crate::token::TokenManager;

const TOKEN_REJECTION_CODES: &[&str] = &["expired_token", "invalid_token"];

/// Outbound CRM REST calls authenticated with the tenant's access token.
pub struct CrmClient {
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    tenant_configs: Arc<TenantConfigCache>,
    base_url: Option<String>,
}

enum Attempt {
    Done(Value),
    TokenRejected,
}

impl CrmClient {
    pub fn new(
        tokens: Arc<TokenManager>,
        tenant_configs: Arc<TenantConfigCache>,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CoordinationError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| CoordinationError::unavailable(Dependency::CrmApi, error))?;
        let base_url = base_url.map(|url| url.trim_end_matches('/').to_string());
        Ok(Self { http, tokens, tenant_configs, base_url })
    }

    /// Calls `method` with `params`. A rejected token is refreshed and the
    /// call retried once; a second rejection is [`CoordinationError::CredentialRejected`].
    pub async fn call_method(
        &self,
        method: &str,
        params: Value,
        tenant_id: &TenantId,
    ) -> Result<Value, CoordinationError> {
        let params = match params {
            Value::Object(params) => params,
            Value::Null => Map::new(),
            other => {
                return Err(CoordinationError::Upstream {
                    method: method.to_string(),
                    status: None,
                    message: format!("params must be a JSON object, got {}", json_kind(&other)),
                })
            }
        };
        let url = self.method_url(method, tenant_id).await?;

        let token = self.tokens.get_token(tenant_id).await?;
        if let Attempt::Done(body) = self.attempt(&url, method, &params, &token).await? {
            return Ok(body);
        }

        info!(
            event_name = "crm.call.token_rejected",
            tenant_id = %tenant_id,
            method,
            "refreshing token and retrying once"
        );
        let token = self.tokens.force_refresh(tenant_id).await?;
        match self.attempt(&url, method, &params, &token).await? {
            Attempt::Done(body) => Ok(body),
            Attempt::TokenRejected => {
                warn!(
                    event_name = "crm.call.credentials_rejected",
                    tenant_id = %tenant_id,
                    method,
                    "refreshed token rejected"
                );
                Err(CoordinationError::CredentialRejected {
                    tenant_id: tenant_id.clone(),
                    method: method.to_string(),
                })
            }
        }
    }

    async fn method_url(&self, method: &str, tenant_id: &TenantId) -> Result<String, CoordinationError> {
        let base = match &self.base_url {
            Some(base) => base.clone(),
            None => {
                let config = self.tenant_configs.get_tenant_config(tenant_id).await?;
                let domain = config.domain.trim_end_matches('/');
                if domain.starts_with("http://") || domain.starts_with("https://") {
                    domain.to_string()
                } else {
                    format!("https://{domain}")
                }
            }
        };
        Ok(format!("{base}/rest/{method}"))
    }

    async fn attempt(
        &self,
        url: &str,
        method: &str,
        params: &Map<String, Value>,
        token: &str,
    ) -> Result<Attempt, CoordinationError> {
        let mut body = params.clone();
        body.insert("auth".to_string(), Value::String(token.to_string()));

        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|error| CoordinationError::unavailable(Dependency::CrmApi, error.without_url()))?;
        let status = response.status();
        let payload: Option<Value> = response.json().await.ok();

        let error_code = payload
            .as_ref()
            .and_then(|payload| payload.get("error"))
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase);

        let token_rejected = status == StatusCode::UNAUTHORIZED
            || error_code.as_deref().is_some_and(|code| TOKEN_REJECTION_CODES.contains(&code));
        if token_rejected {
            return Ok(Attempt::TokenRejected);
        }

        if !status.is_success() || error_code.is_some() {
            let detail = payload
                .as_ref()
                .and_then(|payload| payload.get("error_description"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or(error_code)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            return Err(CoordinationError::Upstream {
                method: method.to_string(),
                status: Some(status.as_u16()),
                message: detail,
            });
        }

        debug!(event_name = "crm.call.succeeded", method, status = status.as_u16());
        payload.ok_or_else(|| CoordinationError::Upstream {
            method: method.to_string(),
            status: Some(status.as_u16()),
            message: "response body was not JSON".to_string(),
        })
        .map(Attempt::Done)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
