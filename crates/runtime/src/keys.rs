//! Key-value store key layout. Every key embeds the tenant or conversation id.

use switchboard_core::{ConversationId, TenantId};

pub fn token(tenant_id: &TenantId) -> String {
    format!("token:{tenant_id}")
}

pub fn tenant_config(tenant_id: &TenantId) -> String {
    format!("config:tenant:{tenant_id}")
}

pub fn conversation_lock(conversation_id: &ConversationId) -> String {
    format!("lock:chat:{conversation_id}")
}

pub fn conversation_tenant(conversation_id: &ConversationId) -> String {
    format!("map:chat_to_tenant:{conversation_id}")
}

pub fn history(conversation_id: &ConversationId) -> String {
    format!("history:{conversation_id}")
}
