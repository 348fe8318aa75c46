use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use switchboard_agent::{AgentFactory, AgentSeed, ConversationAgent};
use switchboard_core::{ConversationId, CoordinationError, TenantId};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::history::ConversationHistory;
use crate::lock::DistributedLock;
use crate::tenant_config::TenantConfigCache;
use crate::token::TokenManager;

/// Future returned by a [`SessionRegistry::with_conversation_lock`] body.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CoordinationError>> + Send + 'a>>;

/// Live agent state for one conversation.
pub struct Session {
    conversation_id: ConversationId,
    tenant_id: TenantId,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    agent: Box<dyn ConversationAgent>,
}

impl Session {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    pub fn agent_mut(&mut self) -> &mut dyn ConversationAgent {
        self.agent.as_mut()
    }
}

struct SessionSlot {
    handle: Arc<Mutex<Session>>,
    tenant_id: TenantId,
    last_used: Instant,
}

/// Owns every live session in this process. All access to a session goes
/// through [`SessionRegistry::with_conversation_lock`], so per-conversation
/// work is serialized across processes by the distributed lock.
pub struct SessionRegistry {
    lock: DistributedLock,
    tenant_configs: Arc<TenantConfigCache>,
    tokens: Arc<TokenManager>,
    history: Arc<ConversationHistory>,
    factory: Arc<dyn AgentFactory>,
    idle_ttl: Duration,
    history_seed: usize,
    sessions: StdMutex<HashMap<ConversationId, SessionSlot>>,
}

impl SessionRegistry {
    pub fn new(
        lock: DistributedLock,
        tenant_configs: Arc<TenantConfigCache>,
        tokens: Arc<TokenManager>,
        history: Arc<ConversationHistory>,
        factory: Arc<dyn AgentFactory>,
        idle_ttl: Duration,
        history_seed: usize,
    ) -> Self {
        Self {
            lock,
            tenant_configs,
            tokens,
            history,
            factory,
            idle_ttl,
            history_seed,
            sessions: StdMutex::new(HashMap::new()),
        }
    }

    /// Runs `body` against the conversation's session while holding its
    /// distributed lock, building the session first if needed.
    ///
    /// The lock is released whether or not `body` succeeds. A failing body
    /// discards the session so the next message starts clean.
    pub async fn with_conversation_lock<T, F>(
        &self,
        conversation_id: &ConversationId,
        tenant_id: &TenantId,
        body: F,
    ) -> Result<T, CoordinationError>
    where
        F: for<'a> FnOnce(&'a mut Session) -> SessionFuture<'a, T>,
    {
        let guard = self.lock.acquire(conversation_id).await?;
        let outcome = self.run_locked(conversation_id, tenant_id, body).await;
        guard.release().await;
        outcome
    }

    async fn run_locked<T, F>(
        &self,
        conversation_id: &ConversationId,
        tenant_id: &TenantId,
        body: F,
    ) -> Result<T, CoordinationError>
    where
        F: for<'a> FnOnce(&'a mut Session) -> SessionFuture<'a, T>,
    {
        let handle = self.checkout(conversation_id, tenant_id).await?;

        let outcome = {
            let mut session = handle.lock().await;
            session.last_used_at = Utc::now();
            let outcome = body(&mut *session).await;
            session.last_used_at = Utc::now();
            outcome
        };

        match &outcome {
            Ok(_) => self.touch(conversation_id, &handle),
            Err(error) => {
                warn!(
                    event_name = "session.registry.body_failed",
                    conversation_id = %conversation_id,
                    tenant_id = %tenant_id,
                    error = %error,
                    "discarding session"
                );
                self.discard(conversation_id, &handle).await;
            }
        }
        outcome
    }

    /// Number of live sessions in this process.
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the conversation's session, if any.
    pub async fn invalidate(&self, conversation_id: &ConversationId) -> bool {
        let removed = self.sessions().remove(conversation_id);
        match removed {
            Some(slot) => {
                close_session(slot.handle).await;
                info!(event_name = "session.registry.invalidated", conversation_id = %conversation_id);
                true
            }
            None => false,
        }
    }

    /// Closes sessions idle for longer than the idle TTL. Sessions in use are
    /// left for a later sweep.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired = {
            let mut sessions = self.sessions();
            let candidates: Vec<ConversationId> = sessions
                .iter()
                .filter(|(_, slot)| now.saturating_duration_since(slot.last_used) > self.idle_ttl)
                .map(|(id, _)| id.clone())
                .collect();

            let mut expired = Vec::with_capacity(candidates.len());
            for conversation_id in candidates {
                let Some(slot) = sessions.get(&conversation_id) else {
                    continue;
                };
                let Ok(session) = Arc::clone(&slot.handle).try_lock_owned() else {
                    debug!(
                        event_name = "session.sweep.skipped_busy",
                        conversation_id = %conversation_id
                    );
                    continue;
                };
                sessions.remove(&conversation_id);
                expired.push(session);
            }
            expired
        };

        let swept = expired.len();
        for mut session in expired {
            session.agent.close().await;
            debug!(
                event_name = "session.sweep.closed",
                conversation_id = %session.conversation_id,
                tenant_id = %session.tenant_id
            );
        }
        if swept > 0 {
            info!(event_name = "session.sweep.completed", swept, "idle sessions closed");
        }
        swept
    }

    /// Closes every session. Used on shutdown.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<SessionSlot> = self.sessions().drain().map(|(_, slot)| slot).collect();
        let closed = drained.len();
        for slot in drained {
            close_session(slot.handle).await;
        }
        closed
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ConversationId, SessionSlot>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn checkout(
        &self,
        conversation_id: &ConversationId,
        tenant_id: &TenantId,
    ) -> Result<Arc<Mutex<Session>>, CoordinationError> {
        let stale = {
            let mut sessions = self.sessions();
            let now = Instant::now();
            let reusable = sessions.get(conversation_id).map(|slot| {
                slot.tenant_id == *tenant_id
                    && now.saturating_duration_since(slot.last_used) <= self.idle_ttl
            });
            match reusable {
                Some(true) => {
                    if let Some(slot) = sessions.get_mut(conversation_id) {
                        slot.last_used = now;
                        return Ok(Arc::clone(&slot.handle));
                    }
                    None
                }
                Some(false) => sessions.remove(conversation_id),
                None => None,
            }
        };

        if let Some(stale) = stale {
            debug!(
                event_name = "session.registry.replaced",
                conversation_id = %conversation_id,
                previous_tenant_id = %stale.tenant_id,
                "session expired or tenant changed"
            );
            close_session(stale.handle).await;
        }

        let session = self.build(conversation_id, tenant_id).await?;
        let handle = Arc::new(Mutex::new(session));
        self.sessions().insert(
            conversation_id.clone(),
            SessionSlot {
                handle: Arc::clone(&handle),
                tenant_id: tenant_id.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(handle)
    }

    async fn build(
        &self,
        conversation_id: &ConversationId,
        tenant_id: &TenantId,
    ) -> Result<Session, CoordinationError> {
        let config = self.tenant_configs.get_tenant_config(tenant_id).await?;
        self.tokens.get_token(tenant_id).await?;
        let history = self.history.recent(conversation_id, self.history_seed).await;
        let seeded_turns = history.len();

        let seed = AgentSeed {
            conversation_id: conversation_id.clone(),
            tenant_id: tenant_id.clone(),
            config,
            history,
        };
        let agent = self
            .factory
            .build(seed)
            .await
            .map_err(|error| CoordinationError::Agent(format!("{error:#}")))?;

        info!(
            event_name = "session.registry.created",
            conversation_id = %conversation_id,
            tenant_id = %tenant_id,
            seeded_turns,
            "session created"
        );
        let now = Utc::now();
        Ok(Session {
            conversation_id: conversation_id.clone(),
            tenant_id: tenant_id.clone(),
            created_at: now,
            last_used_at: now,
            agent,
        })
    }

    fn touch(&self, conversation_id: &ConversationId, handle: &Arc<Mutex<Session>>) {
        let mut sessions = self.sessions();
        if let Some(slot) = sessions.get_mut(conversation_id) {
            if Arc::ptr_eq(&slot.handle, handle) {
                slot.last_used = Instant::now();
            }
        }
    }

    async fn discard(&self, conversation_id: &ConversationId, handle: &Arc<Mutex<Session>>) {
        let removed = {
            let mut sessions = self.sessions();
            let owned = sessions
                .get(conversation_id)
                .is_some_and(|slot| Arc::ptr_eq(&slot.handle, handle));
            if owned {
                sessions.remove(conversation_id)
            } else {
                None
            }
        };
        if let Some(slot) = removed {
            close_session(slot.handle).await;
        }
    }
}

async fn close_session(handle: Arc<Mutex<Session>>) {
    let mut session = handle.lock().await;
    session.agent.close().await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use switchboard_core::{ConversationId, CoordinationError, TenantId};
    use tokio::sync::oneshot;

    use crate::testing::{harness, seed_tenant, HarnessOptions};

    #[tokio::test]
    async fn session_is_built_once_and_reused() {
        let harness = harness(HarnessOptions::default()).await;
        let conversation = ConversationId::from("chat-1");
        let tenant = TenantId::from("acme");

        for message in ["one", "two"] {
            let expected = format!("stub: {message}");
            let message = message.to_string();
            let reply = harness
                .registry
                .with_conversation_lock(&conversation, &tenant, move |session| {
                    Box::pin(async move {
                        session
                            .agent_mut()
                            .respond(&message)
                            .await
                            .map_err(|error| CoordinationError::Agent(error.to_string()))
                    })
                })
                .await
                .expect("reply");
            assert_eq!(reply, expected);
        }

        assert_eq!(harness.factory.builds(), 1);
        assert_eq!(harness.registry.len(), 1);
    }

    #[tokio::test]
    async fn same_conversation_bodies_never_overlap() {
        let harness = harness(HarnessOptions {
            lock_wait: Duration::from_secs(10),
            lock_poll: Duration::from_millis(5),
            ..HarnessOptions::default()
        })
        .await;
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let registry = harness.registry.clone();
                let active = active.clone();
                let max_seen = max_seen.clone();
                tokio::spawn(async move {
                    registry
                        .with_conversation_lock(
                            &ConversationId::from("chat-1"),
                            &TenantId::from("acme"),
                            move |_session| {
                                Box::pin(async move {
                                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                                    max_seen.fetch_max(now, Ordering::SeqCst);
                                    tokio::time::sleep(Duration::from_millis(20)).await;
                                    active.fetch_sub(1, Ordering::SeqCst);
                                    Ok(())
                                })
                            },
                        )
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.expect("join").expect("locked body");
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_body_discards_the_session() {
        let harness = harness(HarnessOptions::default()).await;
        let conversation = ConversationId::from("chat-1");
        let tenant = TenantId::from("acme");

        let result: Result<(), _> = harness
            .registry
            .with_conversation_lock(&conversation, &tenant, |_session| {
                Box::pin(async { Err(CoordinationError::Agent("boom".to_string())) })
            })
            .await;
        assert!(result.is_err());
        assert!(harness.registry.is_empty());
        assert_eq!(harness.factory.closed(), 1);

        harness
            .registry
            .with_conversation_lock(&conversation, &tenant, |_session| Box::pin(async { Ok(()) }))
            .await
            .expect("lock was released and a fresh session built");
        assert_eq!(harness.factory.builds(), 2);
    }

    #[tokio::test]
    async fn construction_failure_registers_nothing() {
        let harness = harness(HarnessOptions::default()).await;
        let conversation = ConversationId::from("chat-1");

        let error = harness
            .registry
            .with_conversation_lock(&conversation, &TenantId::from("ghost"), |_session| {
                Box::pin(async { Ok(()) })
            })
            .await
            .expect_err("unknown tenant");

        assert!(matches!(error, CoordinationError::TenantNotConfigured { .. }));
        assert!(harness.registry.is_empty());
        assert_eq!(harness.factory.builds(), 0);
        assert!(harness.kv_value("lock:chat:chat-1").await.is_none());
    }

    #[tokio::test]
    async fn tenant_change_rebuilds_the_session() {
        let harness = harness(HarnessOptions::default()).await;
        seed_tenant(&harness.records, "globex").await;
        let conversation = ConversationId::from("chat-1");

        for tenant in ["acme", "globex"] {
            let tenant = TenantId::from(tenant);
            let seen = harness
                .registry
                .with_conversation_lock(&conversation, &tenant, |session| {
                    let tenant_id = session.tenant_id().clone();
                    Box::pin(async move { Ok(tenant_id) })
                })
                .await
                .expect("session");
            assert_eq!(seen, tenant);
        }

        assert_eq!(harness.factory.builds(), 2);
        assert_eq!(harness.factory.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_sweep_without_activity_is_a_no_op() {
        let harness = harness(HarnessOptions::default()).await;
        for id in ["chat-1", "chat-2"] {
            harness
                .registry
                .with_conversation_lock(&ConversationId::from(id), &TenantId::from("acme"), |_session| {
                    Box::pin(async { Ok(()) })
                })
                .await
                .expect("session");
        }

        assert_eq!(harness.registry.sweep_expired().await, 0, "nothing idle yet");
        tokio::time::advance(Duration::from_secs(1_801)).await;

        assert_eq!(harness.registry.sweep_expired().await, 2);
        assert_eq!(harness.registry.sweep_expired().await, 0);
        assert_eq!(harness.factory.closed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_skips_sessions_in_use() {
        let harness = harness(HarnessOptions::default()).await;
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let (finish_tx, finish_rx) = oneshot::channel::<()>();

        let registry = harness.registry.clone();
        let running = tokio::spawn(async move {
            registry
                .with_conversation_lock(
                    &ConversationId::from("chat-1"),
                    &TenantId::from("acme"),
                    move |_session| {
                        Box::pin(async move {
                            let _ = entered_tx.send(());
                            let _ = finish_rx.await;
                            Ok(())
                        })
                    },
                )
                .await
        });

        entered_rx.await.expect("body started");
        tokio::time::advance(Duration::from_secs(1_801)).await;
        assert_eq!(harness.registry.sweep_expired().await, 0);

        finish_tx.send(()).expect("finish body");
        running.await.expect("join").expect("body");
        assert_eq!(harness.registry.len(), 1);
    }

    #[tokio::test]
    async fn close_all_closes_every_agent() {
        let harness = harness(HarnessOptions::default()).await;
        harness
            .registry
            .with_conversation_lock(&ConversationId::from("chat-1"), &TenantId::from("acme"), |_session| {
                Box::pin(async { Ok(()) })
            })
            .await
            .expect("session");

        assert_eq!(harness.registry.close_all().await, 1);
        assert!(harness.registry.is_empty());
        assert_eq!(harness.factory.closed(), 1);
        assert!(!harness.registry.invalidate(&ConversationId::from("chat-1")).await);
    }
}
