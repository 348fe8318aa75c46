use anyhow::Result;
use async_trait::async_trait;
use switchboard_core::{ChatTurn, ConversationId, TenantConfig, TenantId};

/// Everything a factory needs to build an agent for a fresh session.
#[derive(Clone, Debug)]
pub struct AgentSeed {
    pub conversation_id: ConversationId,
    pub tenant_id: TenantId,
    pub config: TenantConfig,
    /// Most recent turns, oldest first.
    pub history: Vec<ChatTurn>,
}

#[async_trait]
pub trait ConversationAgent: Send {
    async fn respond(&mut self, message: &str) -> Result<String>;

    /// Called once when the owning session is swept or invalidated.
    async fn close(&mut self) {}
}

#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn build(&self, seed: AgentSeed) -> Result<Box<dyn ConversationAgent>>;
}
