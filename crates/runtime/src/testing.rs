//! Fixtures shared by the runtime unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use switchboard_agent::{AgentFactory, AgentSeed, ConversationAgent};
use switchboard_core::{ClientCredentials, CoordinationError, TenantId};
use switchboard_store::{
    Collection, Document, InMemoryDocumentStore, KeyValueStore, LocalKeyValueStore, SourceOfRecord,
};

use crate::history::ConversationHistory;
use crate::lock::DistributedLock;
use crate::oauth::{GrantedToken, TokenEndpoint};
use crate::session::SessionRegistry;
use crate::tenant_config::TenantConfigCache;
use crate::token::TokenManager;

pub(crate) fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

/// Installation with a token valid for an hour plus client credentials.
pub(crate) async fn seed_tenant(records: &InMemoryDocumentStore, tenant: &str) {
    records
        .set_document(
            Collection::Installations,
            tenant,
            doc(json!({
                "domain": format!("{tenant}.example.com"),
                "accessToken": format!("{tenant}-access"),
                "refreshToken": format!("{tenant}-refresh"),
                "expiresAt": (Utc::now() + chrono::Duration::hours(1)).timestamp_millis(),
            })),
        )
        .await
        .expect("seed installation");
    records
        .set_document(
            Collection::Secrets,
            tenant,
            doc(json!({"clientId": "app.1", "clientSecret": "secret"})),
        )
        .await
        .expect("seed secrets");
}

pub(crate) struct RejectingEndpoint;

#[async_trait]
impl TokenEndpoint for RejectingEndpoint {
    async fn refresh(
        &self,
        tenant_id: &TenantId,
        _credentials: &ClientCredentials,
        _refresh_token: &str,
    ) -> Result<GrantedToken, CoordinationError> {
        Err(CoordinationError::CredentialExchange {
            tenant_id: tenant_id.clone(),
            status: Some(400),
            message: "refresh not expected in this test".to_string(),
        })
    }
}

struct StubAgent {
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl ConversationAgent for StubAgent {
    async fn respond(&mut self, message: &str) -> Result<String> {
        match message {
            "fail" => Err(anyhow!("model provider unavailable")),
            "silence" => Ok(String::new()),
            other => Ok(format!("stub: {other}")),
        }
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct StubFactory {
    builds: AtomicUsize,
    closed: Arc<AtomicUsize>,
    seeds: Mutex<Vec<AgentSeed>>,
}

impl StubFactory {
    pub(crate) fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn last_seed(&self) -> Option<AgentSeed> {
        self.seeds.lock().expect("seeds lock").last().cloned()
    }
}

#[async_trait]
impl AgentFactory for StubFactory {
    async fn build(&self, seed: AgentSeed) -> Result<Box<dyn ConversationAgent>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.seeds.lock().expect("seeds lock").push(seed);
        Ok(Box::new(StubAgent { closed: Arc::clone(&self.closed) }))
    }
}

pub(crate) struct HarnessOptions {
    pub idle_ttl: Duration,
    pub lock_wait: Duration,
    pub lock_poll: Duration,
    pub history_seed: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(1_800),
            lock_wait: Duration::from_secs(2),
            lock_poll: Duration::from_millis(50),
            history_seed: 6,
        }
    }
}

pub(crate) struct Harness {
    pub kv: Arc<LocalKeyValueStore>,
    pub records: Arc<InMemoryDocumentStore>,
    pub tenant_configs: Arc<TenantConfigCache>,
    pub history: Arc<ConversationHistory>,
    pub factory: Arc<StubFactory>,
    pub registry: Arc<SessionRegistry>,
}

impl Harness {
    pub(crate) async fn kv_value(&self, key: &str) -> Option<String> {
        self.kv.get(key).await.expect("kv read")
    }
}

/// Registry over in-memory stores with tenant `acme` installed.
pub(crate) async fn harness(options: HarnessOptions) -> Harness {
    let kv = Arc::new(LocalKeyValueStore::new());
    let records = Arc::new(InMemoryDocumentStore::new());
    seed_tenant(&records, "acme").await;

    let tokens = Arc::new(TokenManager::new(
        kv.clone(),
        records.clone(),
        Arc::new(RejectingEndpoint),
        None,
        chrono::Duration::seconds(300),
    ));
    let tenant_configs =
        Arc::new(TenantConfigCache::new(kv.clone(), records.clone(), Duration::from_secs(3_600)));
    let history =
        Arc::new(ConversationHistory::new(kv.clone(), 10, Duration::from_secs(7 * 24 * 3_600)));
    let factory = Arc::new(StubFactory::default());
    let lock = DistributedLock::new(
        kv.clone(),
        Duration::from_secs(120),
        options.lock_wait,
        options.lock_poll,
    );
    let registry = Arc::new(SessionRegistry::new(
        lock,
        tenant_configs.clone(),
        tokens,
        history.clone(),
        factory.clone(),
        options.idle_ttl,
        options.history_seed,
    ));

    Harness { kv, records, tenant_configs, history, factory, registry }
}
