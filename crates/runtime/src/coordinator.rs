use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use switchboard_agent::{AgentFactory, EchoLlmClient, LlmAgentFactory, PromptRenderer};
use switchboard_core::config::AppConfig;
use switchboard_core::{ClientCredentials, CoordinationError, Dependency};
use switchboard_store::{KeyValueStore, SourceOfRecord};
use tracing::info;

use crate::conversation::ConversationService;
use crate::crm::CrmClient;
use crate::history::ConversationHistory;
use crate::lock::DistributedLock;
use crate::oauth::{HttpTokenEndpoint, TokenEndpoint};
use crate::session::SessionRegistry;
use crate::tenant_config::TenantConfigCache;
use crate::token::TokenManager;
use crate::workers::{spawn_config_invalidator, spawn_session_sweeper, BackgroundWorker};

/// Builds a [`Coordinator`] from loaded config and connected stores.
pub struct CoordinatorBuilder {
    config: AppConfig,
    kv: Arc<dyn KeyValueStore>,
    records: Arc<dyn SourceOfRecord>,
    token_endpoint: Option<Arc<dyn TokenEndpoint>>,
    agent_factory: Option<Arc<dyn AgentFactory>>,
}

impl CoordinatorBuilder {
    pub fn new(config: AppConfig, kv: Arc<dyn KeyValueStore>, records: Arc<dyn SourceOfRecord>) -> Self {
        Self { config, kv, records, token_endpoint: None, agent_factory: None }
    }

    pub fn token_endpoint(mut self, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        self.token_endpoint = Some(endpoint);
        self
    }

    pub fn agent_factory(mut self, factory: Arc<dyn AgentFactory>) -> Self {
        self.agent_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<Coordinator, CoordinationError> {
        let config = self.config;
        let session = &config.session;

        let token_endpoint = match self.token_endpoint {
            Some(endpoint) => endpoint,
            None => Arc::new(HttpTokenEndpoint::new(
                config.oauth.token_url.clone(),
                Duration::from_secs(config.oauth.timeout_secs),
            )?),
        };
        let agent_factory = match self.agent_factory {
            Some(factory) => factory,
            None => {
                let renderer = PromptRenderer::new()
                    .map_err(|error| CoordinationError::Agent(format!("{error:#}")))?;
                Arc::new(LlmAgentFactory::new(Arc::new(EchoLlmClient), renderer))
            }
        };

        let global_credentials = config
            .global_client_credentials()
            .map(|(client_id, client_secret)| ClientCredentials { client_id, client_secret });
        let tokens = Arc::new(TokenManager::new(
            Arc::clone(&self.kv),
            Arc::clone(&self.records),
            token_endpoint,
            global_credentials,
            chrono::Duration::seconds(i64::try_from(config.oauth.safety_margin_secs).unwrap_or(i64::MAX)),
        ));
        let tenant_configs = Arc::new(TenantConfigCache::new(
            Arc::clone(&self.kv),
            Arc::clone(&self.records),
            Duration::from_secs(config.tenant_config.cache_ttl_secs),
        ));
        let history = Arc::new(ConversationHistory::new(
            Arc::clone(&self.kv),
            session.history_limit,
            Duration::from_secs(session.history_ttl_secs),
        ));
        let lock = DistributedLock::new(
            Arc::clone(&self.kv),
            Duration::from_secs(session.lock_lease_secs),
            Duration::from_secs(session.lock_wait_secs),
            Duration::from_millis(session.lock_poll_ms),
        );
        let sessions = Arc::new(SessionRegistry::new(
            lock,
            Arc::clone(&tenant_configs),
            Arc::clone(&tokens),
            Arc::clone(&history),
            agent_factory,
            Duration::from_secs(session.idle_ttl_secs),
            session.history_seed,
        ));
        let conversations = Arc::new(ConversationService::new(
            Arc::clone(&sessions),
            Arc::clone(&history),
            Arc::clone(&self.kv),
            Duration::from_secs(session.tenant_mapping_ttl_secs),
        ));
        let crm = Arc::new(CrmClient::new(
            Arc::clone(&tokens),
            Arc::clone(&tenant_configs),
            config.crm.base_url.clone(),
            Duration::from_secs(config.crm.timeout_secs),
        )?);

        Ok(Coordinator {
            config,
            kv: self.kv,
            records: self.records,
            tokens,
            tenant_configs,
            sessions,
            conversations,
            crm,
            workers: Mutex::new(Vec::new()),
        })
    }
}

/// Owns every client, cache and registry for one process.
pub struct Coordinator {
    config: AppConfig,
    kv: Arc<dyn KeyValueStore>,
    records: Arc<dyn SourceOfRecord>,
    tokens: Arc<TokenManager>,
    tenant_configs: Arc<TenantConfigCache>,
    sessions: Arc<SessionRegistry>,
    conversations: Arc<ConversationService>,
    crm: Arc<CrmClient>,
    workers: Mutex<Vec<BackgroundWorker>>,
}

impl Coordinator {
    pub fn builder(
        config: AppConfig,
        kv: Arc<dyn KeyValueStore>,
        records: Arc<dyn SourceOfRecord>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config, kv, records)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    pub fn records(&self) -> &Arc<dyn SourceOfRecord> {
        &self.records
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn tenant_configs(&self) -> &Arc<TenantConfigCache> {
        &self.tenant_configs
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn conversations(&self) -> &Arc<ConversationService> {
        &self.conversations
    }

    pub fn crm(&self) -> &Arc<CrmClient> {
        &self.crm
    }

    /// Starts the session sweeper and the tenant config invalidation listener.
    pub async fn start_workers(&self) -> Result<(), CoordinationError> {
        let sweeper = spawn_session_sweeper(
            Arc::clone(&self.sessions),
            Duration::from_secs(self.config.session.sweep_interval_secs),
        );
        let invalidator =
            spawn_config_invalidator(Arc::clone(&self.records), Arc::clone(&self.tenant_configs))
                .await
                .map_err(|error| CoordinationError::unavailable(Dependency::SourceOfRecord, error));

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.push(sweeper);
        workers.push(invalidator?);
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Stops workers, then closes every live session.
    pub async fn shutdown(&self) {
        let workers: Vec<BackgroundWorker> =
            self.workers.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        for worker in workers {
            worker.stop().await;
        }
        let closed = self.sessions.close_all().await;
        info!(event_name = "runtime.coordinator.shutdown", closed_sessions = closed, "coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use switchboard_core::config::AppConfig;
    use switchboard_core::{ConversationId, Reply, TenantId};
    use switchboard_store::{InMemoryDocumentStore, LocalKeyValueStore};

    use super::Coordinator;
    use crate::testing::{seed_tenant, RejectingEndpoint};

    #[tokio::test]
    async fn default_agent_echoes_and_shutdown_closes_sessions() {
        let records = Arc::new(InMemoryDocumentStore::new());
        seed_tenant(&records, "acme").await;
        let coordinator =
            Coordinator::builder(AppConfig::default(), Arc::new(LocalKeyValueStore::new()), records)
                .token_endpoint(Arc::new(RejectingEndpoint))
                .build()
                .expect("coordinator");
        coordinator.start_workers().await.expect("workers");
        assert_eq!(coordinator.worker_count(), 2);

        let reply = coordinator
            .conversations()
            .handle(&ConversationId::from("chat-1"), "hello", Some(TenantId::from("acme")))
            .await;

        assert_eq!(reply, Reply::Answer("echo: hello".to_string()));
        assert_eq!(coordinator.sessions().len(), 1);

        coordinator.shutdown().await;
        assert_eq!(coordinator.worker_count(), 0);
        assert!(coordinator.sessions().is_empty());
    }
}
