use std::sync::Arc;
use std::time::Duration;

use switchboard_core::errors::{APOLOGY_MESSAGE, BUSY_MESSAGE};
use switchboard_core::{ChatTurn, ConversationId, CoordinationError, Dependency, Reply, TenantId};
use switchboard_store::KeyValueStore;
use tracing::{error, info, warn};

use crate::history::ConversationHistory;
use crate::keys;
use crate::session::SessionRegistry;

/// Sent when the agent produced an empty answer.
pub const FALLBACK_REPLY: &str =
    "I couldn't come up with an answer to that. Could you rephrase or add more detail?";

/// Webhook-facing entry point: one inbound chat message in, one reply out.
pub struct ConversationService {
    registry: Arc<SessionRegistry>,
    history: Arc<ConversationHistory>,
    kv: Arc<dyn KeyValueStore>,
    mapping_ttl: Duration,
}

impl ConversationService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        history: Arc<ConversationHistory>,
        kv: Arc<dyn KeyValueStore>,
        mapping_ttl: Duration,
    ) -> Self {
        Self { registry, history, kv, mapping_ttl }
    }

    /// Never fails: errors become an apology and contention a busy notice.
    pub async fn handle(
        &self,
        conversation_id: &ConversationId,
        message: &str,
        tenant_hint: Option<TenantId>,
    ) -> Reply {
        match self.process(conversation_id, message, tenant_hint).await {
            Ok(answer) => Reply::Answer(answer),
            Err(CoordinationError::Busy { reason, .. }) => {
                info!(
                    event_name = "conversation.message.busy",
                    conversation_id = %conversation_id,
                    reason = ?reason,
                    "conversation locked by another worker"
                );
                Reply::Busy(BUSY_MESSAGE.to_string())
            }
            Err(failure) => {
                error!(
                    event_name = "conversation.message.failed",
                    conversation_id = %conversation_id,
                    error_class = ?failure.class(),
                    error = %failure,
                    "message processing failed"
                );
                Reply::Apology(APOLOGY_MESSAGE.to_string())
            }
        }
    }

    async fn process(
        &self,
        conversation_id: &ConversationId,
        message: &str,
        tenant_hint: Option<TenantId>,
    ) -> Result<String, CoordinationError> {
        let tenant_id = self.resolve_tenant(conversation_id, tenant_hint).await?;
        let history = Arc::clone(&self.history);
        let message = message.to_string();
        let owned_conversation = conversation_id.clone();

        let answer = self
            .registry
            .with_conversation_lock(conversation_id, &tenant_id, move |session| {
                Box::pin(async move {
                    let reply = session
                        .agent_mut()
                        .respond(&message)
                        .await
                        .map_err(|failure| CoordinationError::Agent(format!("{failure:#}")))?;
                    let reply = if reply.trim().is_empty() { FALLBACK_REPLY.to_string() } else { reply };

                    history
                        .append(
                            &owned_conversation,
                            &[ChatTurn::user(message), ChatTurn::assistant(reply.clone())],
                        )
                        .await;
                    Ok::<_, CoordinationError>(reply)
                })
            })
            .await?;

        info!(
            event_name = "conversation.message.answered",
            conversation_id = %conversation_id,
            tenant_id = %tenant_id,
            "reply ready"
        );
        Ok(answer)
    }

    /// A hint is remembered for later messages that arrive without one.
    async fn resolve_tenant(
        &self,
        conversation_id: &ConversationId,
        tenant_hint: Option<TenantId>,
    ) -> Result<TenantId, CoordinationError> {
        let key = keys::conversation_tenant(conversation_id);

        if let Some(tenant_id) = tenant_hint {
            if let Err(failure) = self.kv.set(&key, tenant_id.as_str(), Some(self.mapping_ttl)).await {
                warn!(
                    event_name = "conversation.tenant.mapping_write_failed",
                    conversation_id = %conversation_id,
                    tenant_id = %tenant_id,
                    error = %failure,
                    "tenant mapping not recorded"
                );
            }
            return Ok(tenant_id);
        }

        match self.kv.get(&key).await {
            Ok(Some(tenant)) if !tenant.trim().is_empty() => Ok(TenantId::new(tenant)),
            Ok(_) => Err(CoordinationError::TenantNotConfigured {
                tenant_id: TenantId::new(""),
                reason: format!("no tenant known for conversation `{conversation_id}`"),
            }),
            Err(failure) => Err(CoordinationError::unavailable(Dependency::KeyValueStore, failure)),
        }
    }
}
