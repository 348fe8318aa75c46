//! Multi-tenant credential and session coordination.
//!
//! [`Coordinator`] owns the shared stores and wires the components:
//! [`TokenManager`] for OAuth access tokens, [`TenantConfigCache`] for merged
//! tenant configuration, [`SessionRegistry`] with [`DistributedLock`] for
//! per-conversation exclusivity, [`ConversationService`] as the webhook entry
//! point and [`CrmClient`] for outbound REST calls.

pub mod conversation;
pub mod coordinator;
pub mod crm;
pub mod history;
pub mod keys;
pub mod lock;
pub mod oauth;
pub mod session;
pub mod tenant_config;
pub mod token;
pub mod workers;

#[cfg(test)]
mod testing;

pub use conversation::ConversationService;
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use crm::CrmClient;
pub use history::ConversationHistory;
pub use lock::{DistributedLock, LockGuard};
pub use oauth::{GrantedToken, HttpTokenEndpoint, TokenEndpoint};
pub use session::{Session, SessionFuture, SessionRegistry};
pub use tenant_config::TenantConfigCache;
pub use token::TokenManager;
pub use workers::{BackgroundWorker, ShutdownSignal};
