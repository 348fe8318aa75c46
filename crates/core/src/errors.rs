use std::fmt;

use thiserror::Error;

use crate::domain::conversation::ConversationId;
use crate::domain::tenant::TenantId;

pub const APOLOGY_MESSAGE: &str =
    "Sorry, something went wrong while processing your message. Please try again.";
pub const BUSY_MESSAGE: &str =
    "I'm still working on your previous message. Please try again in a moment.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dependency {
    KeyValueStore,
    SourceOfRecord,
    TokenEndpoint,
    CrmApi,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::KeyValueStore => "key-value store",
            Self::SourceOfRecord => "source of record",
            Self::TokenEndpoint => "oauth token endpoint",
            Self::CrmApi => "crm api",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusyReason {
    /// Another worker holds the conversation lock past the wait timeout.
    Contention,
    /// The lock store could not be reached, so exclusivity cannot be proven.
    LockStoreUnavailable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    TransientDependency,
    CredentialExchange,
    CredentialRejection,
    LockContention,
    Upstream,
    Agent,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("tenant `{tenant_id}` is not configured: {reason}")]
    TenantNotConfigured { tenant_id: TenantId, reason: String },
    #[error("{dependency} unavailable: {message}")]
    DependencyUnavailable { dependency: Dependency, message: String },
    #[error("credential exchange failed for tenant `{tenant_id}` (status {status:?}): {message}")]
    CredentialExchange { tenant_id: TenantId, status: Option<u16>, message: String },
    #[error("crm rejected refreshed credentials for tenant `{tenant_id}` calling `{method}`")]
    CredentialRejected { tenant_id: TenantId, method: String },
    #[error("crm method `{method}` failed (status {status:?}): {message}")]
    Upstream { method: String, status: Option<u16>, message: String },
    #[error("conversation `{conversation_id}` is busy ({reason:?})")]
    Busy { conversation_id: ConversationId, reason: BusyReason },
    #[error("agent failure: {0}")]
    Agent(String),
}

impl CoordinationError {
    pub fn not_configured(tenant_id: &TenantId, reason: impl Into<String>) -> Self {
        Self::TenantNotConfigured { tenant_id: tenant_id.clone(), reason: reason.into() }
    }

    pub fn unavailable(dependency: Dependency, message: impl fmt::Display) -> Self {
        Self::DependencyUnavailable { dependency, message: message.to_string() }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TenantNotConfigured { .. } => ErrorClass::Configuration,
            Self::DependencyUnavailable { .. } => ErrorClass::TransientDependency,
            Self::CredentialExchange { .. } => ErrorClass::CredentialExchange,
            Self::CredentialRejected { .. } => ErrorClass::CredentialRejection,
            Self::Upstream { .. } => ErrorClass::Upstream,
            Self::Busy { .. } => ErrorClass::LockContention,
            Self::Agent(_) => ErrorClass::Agent,
        }
    }

    /// Whether a caller may retry the same operation later with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::TransientDependency
                | ErrorClass::CredentialExchange
                | ErrorClass::LockContention
                | ErrorClass::Upstream
        )
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Busy { .. } => BUSY_MESSAGE,
            _ => APOLOGY_MESSAGE,
        }
    }
}
