use std::sync::Arc;
use std::time::Duration;

use switchboard_core::{ChatTurn, ConversationId};
use switchboard_store::KeyValueStore;
use tracing::warn;

use crate::keys;

/// Capped per-conversation turn log in the key-value store. Best effort: a
/// store failure loses history, never the reply.
pub struct ConversationHistory {
    kv: Arc<dyn KeyValueStore>,
    limit: usize,
    ttl: Duration,
}

impl ConversationHistory {
    pub fn new(kv: Arc<dyn KeyValueStore>, limit: usize, ttl: Duration) -> Self {
        Self { kv, limit, ttl }
    }

    /// Up to `count` most recent turns, oldest first.
    pub async fn recent(&self, conversation_id: &ConversationId, count: usize) -> Vec<ChatTurn> {
        let mut turns = self.load(conversation_id).await;
        if turns.len() > count {
            turns.drain(..turns.len() - count);
        }
        turns
    }

    pub async fn append(&self, conversation_id: &ConversationId, new_turns: &[ChatTurn]) {
        if new_turns.is_empty() {
            return;
        }

        let mut turns = self.load(conversation_id).await;
        turns.extend_from_slice(new_turns);
        if turns.len() > self.limit {
            turns.drain(..turns.len() - self.limit);
        }

        let raw = match serde_json::to_string(&turns) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(event_name = "session.history.encode_failed", error = %error);
                return;
            }
        };
        if let Err(error) = self.kv.set(&keys::history(conversation_id), &raw, Some(self.ttl)).await {
            warn!(
                event_name = "session.history.write_failed",
                conversation_id = %conversation_id,
                error = %error,
                "conversation history not saved"
            );
        }
    }

    async fn load(&self, conversation_id: &ConversationId) -> Vec<ChatTurn> {
        let raw = match self.kv.get(&keys::history(conversation_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(error) => {
                warn!(
                    event_name = "session.history.read_failed",
                    conversation_id = %conversation_id,
                    error = %error,
                    "continuing without history"
                );
                return Vec::new();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|error| {
            warn!(
                event_name = "session.history.decode_failed",
                conversation_id = %conversation_id,
                error = %error,
                "discarding unreadable history"
            );
            Vec::new()
        })
    }
}
