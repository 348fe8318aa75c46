pub mod config;
pub mod domain;
pub mod errors;

pub use domain::conversation::{ChatTurn, ConversationId, Reply, TurnRole};
pub use domain::tenant::{
    merge_tenant_config, ClientCredentials, ConfigSources, TenantConfig, TenantId, TenantToken,
};
pub use errors::{BusyReason, CoordinationError, Dependency, ErrorClass};
