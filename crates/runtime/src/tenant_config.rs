use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use switchboard_core::{
    merge_tenant_config, ConfigSources, CoordinationError, Dependency, TenantConfig, TenantId,
};
use switchboard_store::{Collection, Document, FieldFilter, KeyValueStore, SourceOfRecord, StoreError};
use tracing::{debug, info, warn};

use crate::keys;

const SHARED_SETTINGS_ID: &str = "ai";

/// Read-through cache of merged tenant configuration.
pub struct TenantConfigCache {
    kv: Arc<dyn KeyValueStore>,
    records: Arc<dyn SourceOfRecord>,
    ttl: Duration,
    generations: Mutex<HashMap<TenantId, u64>>,
}

impl TenantConfigCache {
    pub fn new(kv: Arc<dyn KeyValueStore>, records: Arc<dyn SourceOfRecord>, ttl: Duration) -> Self {
        Self { kv, records, ttl, generations: Mutex::new(HashMap::new()) }
    }

    pub async fn get_tenant_config(
        &self,
        tenant_id: &TenantId,
    ) -> Result<TenantConfig, CoordinationError> {
        let key = keys::tenant_config(tenant_id);
        match self.kv.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<TenantConfig>(&raw) {
                Ok(config) => {
                    debug!(event_name = "config.tenant.cache_hit", tenant_id = %tenant_id);
                    return Ok(config);
                }
                Err(error) => warn!(
                    event_name = "config.tenant.cache_decode_failed",
                    tenant_id = %tenant_id,
                    error = %error,
                    "rebuilding tenant config"
                ),
            },
            Ok(None) => {}
            Err(error) => warn!(
                event_name = "config.tenant.cache_read_failed",
                tenant_id = %tenant_id,
                error = %error,
                "reading tenant config from the source of record"
            ),
        }

        let generation = self.generation(tenant_id);
        let config = self.build(tenant_id).await?;

        if self.generation(tenant_id) != generation {
            debug!(
                event_name = "config.tenant.stale_build_dropped",
                tenant_id = %tenant_id,
                "invalidated during build; not caching"
            );
            return Ok(config);
        }

        match serde_json::to_string(&config) {
            Ok(raw) => {
                if let Err(error) = self.kv.set(&key, &raw, Some(self.ttl)).await {
                    warn!(
                        event_name = "config.tenant.cache_write_failed",
                        tenant_id = %tenant_id,
                        error = %error,
                        "tenant config not cached"
                    );
                }
            }
            Err(error) => warn!(event_name = "config.tenant.cache_encode_failed", error = %error),
        }
        Ok(config)
    }

    /// Drops the cached config so the next read rebuilds it.
    pub async fn invalidate(&self, tenant_id: &TenantId) -> Result<(), CoordinationError> {
        {
            let mut generations = self.generations.lock().unwrap_or_else(PoisonError::into_inner);
            *generations.entry(tenant_id.clone()).or_insert(0) += 1;
        }

        self.kv
            .delete(&keys::tenant_config(tenant_id))
            .await
            .map_err(|error| CoordinationError::unavailable(Dependency::KeyValueStore, error))?;
        info!(event_name = "config.tenant.invalidated", tenant_id = %tenant_id);
        Ok(())
    }

    fn generation(&self, tenant_id: &TenantId) -> u64 {
        let generations = self.generations.lock().unwrap_or_else(PoisonError::into_inner);
        generations.get(tenant_id).copied().unwrap_or(0)
    }

    async fn build(&self, tenant_id: &TenantId) -> Result<TenantConfig, CoordinationError> {
        let active_filters = [
            FieldFilter::new("tenantId", tenant_id.as_str()),
            FieldFilter::new("isActive", true),
        ];
        let (installation, settings, secrets, agent) = tokio::join!(
            self.records.get_document(Collection::Installations, tenant_id.as_str()),
            self.records.get_document(Collection::Settings, SHARED_SETTINGS_ID),
            self.records.get_document(Collection::Secrets, tenant_id.as_str()),
            self.records.query_one(Collection::Agents, &active_filters),
        );
        let installation = installation.map_err(source_unavailable)?;
        let settings = settings.map_err(source_unavailable)?;
        let secrets = secrets.map_err(source_unavailable)?;
        let mut agent = agent.map_err(source_unavailable)?;

        if installation.is_none() && secrets.is_none() {
            return Err(CoordinationError::not_configured(
                tenant_id,
                "no installation or secrets record",
            ));
        }

        // A pinned agent wins over whichever active agent was updated last.
        let pinned = installation.as_ref().and_then(pinned_agent_id);
        if let Some(pinned) = pinned {
            let already_pinned = agent
                .as_ref()
                .is_some_and(|(id, document)| id == &pinned || agent_id_field(document) == Some(pinned.as_str()));
            if !already_pinned {
                let mut filters = active_filters.to_vec();
                filters.push(FieldFilter::new("agentId", pinned.as_str()));
                if let Some(found) = self
                    .records
                    .query_one(Collection::Agents, &filters)
                    .await
                    .map_err(source_unavailable)?
                {
                    agent = Some(found);
                }
            }
        }

        let config = merge_tenant_config(
            tenant_id,
            ConfigSources {
                installation,
                settings,
                agent: agent.map(|(_, document)| document),
                secrets,
            },
        );
        debug!(
            event_name = "config.tenant.built",
            tenant_id = %tenant_id,
            keys = config.values.len(),
            "tenant config merged"
        );
        Ok(config)
    }
}

fn source_unavailable(error: StoreError) -> CoordinationError {
    CoordinationError::unavailable(Dependency::SourceOfRecord, error)
}

fn agent_id_field(document: &Document) -> Option<&str> {
    document.get("agentId").and_then(Value::as_str)
}

fn pinned_agent_id(installation: &Document) -> Option<String> {
    agent_id_field(installation).filter(|id| !id.trim().is_empty()).map(str::to_string)
}
