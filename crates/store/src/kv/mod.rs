use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use switchboard_core::config::{KvConfig, KvMode};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::StoreError;

/// Upper bound on any single lock wait, whatever the caller asked for.
pub const MAX_LOCK_WAIT: Duration = Duration::from_secs(3_600);

pub mod local;
pub mod redis_store;

pub use self::local::LocalKeyValueStore;
pub use self::redis_store::RedisKeyValueStore;

/// A held lock: the key plus the unique token proving ownership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: String,
    pub lease: Duration,
}

/// Shared key-value store used for token caching, tenant config caching,
/// conversation mappings, history and lock leases.
///
/// Every operation is bounded; implementations surface an unreachable or slow
/// backend as [`StoreError::Unavailable`] or [`StoreError::Timeout`] instead of
/// blocking the caller.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes `value`, replacing any previous entry. `None` keeps it until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically writes `value` only when `key` is absent. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Atomically deletes `key` only while it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Polls for `key` until `wait` (capped at [`MAX_LOCK_WAIT`]) elapses.
    /// `Ok(None)` means another holder kept it for the whole wait. The lease expires on its own after `lease`.
    async fn acquire_lock(
        &self,
        key: &str,
        lease: Duration,
        wait: Duration,
        poll: Duration,
    ) -> Result<Option<LockLease>, StoreError> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait.min(MAX_LOCK_WAIT);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if self.set_if_absent(key, &token, lease).await? {
                debug!(event_name = "store.lock.acquired", key, attempts);
                return Ok(Some(LockLease { key: key.to_string(), token, lease }));
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(event_name = "store.lock.timeout", key, attempts);
                return Ok(None);
            }

            let jitter_ms = {
                let max_jitter = u64::try_from(poll.as_millis() / 2).unwrap_or(0);
                rand::thread_rng().gen_range(0..=max_jitter)
            };
            let delay = poll.saturating_add(Duration::from_millis(jitter_ms)).min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    /// Releases only while `lease` still owns the key. Returns whether it did.
    async fn release_lock(&self, lease: &LockLease) -> Result<bool, StoreError> {
        self.delete_if_equals(&lease.key, &lease.token).await
    }
}

/// Builds the configured store. A redis outage at startup is fatal unless
/// `fallback_to_local` is set, in which case locks and caches become
/// process-local.
pub async fn connect_key_value_store(
    config: &KvConfig,
) -> Result<Arc<dyn KeyValueStore>, StoreError> {
    match config.mode {
        KvMode::Local => {
            info!(event_name = "store.kv.selected", backend = "local", "using in-process kv store");
            Ok(Arc::new(LocalKeyValueStore::new()))
        }
        KvMode::Redis => match RedisKeyValueStore::connect(config).await {
            Ok(store) => {
                info!(event_name = "store.kv.selected", backend = "redis", "connected to redis");
                Ok(Arc::new(store))
            }
            Err(error) if config.fallback_to_local => {
                warn!(
                    event_name = "store.kv.fallback",
                    error = %error,
                    "redis unreachable; falling back to process-local kv store, locks are not shared across processes"
                );
                Ok(Arc::new(LocalKeyValueStore::new()))
            }
            Err(error) => Err(error),
        },
    }
}

#[cfg(test)]
mod tests {
    use switchboard_core::config::{AppConfig, KvMode};

    use super::connect_key_value_store;
    use crate::errors::StoreError;

    fn unreachable_redis(fallback_to_local: bool) -> switchboard_core::config::KvConfig {
        let mut config = AppConfig::default().kv;
        config.mode = KvMode::Redis;
        config.url = "redis://127.0.0.1:1/0".to_string();
        config.connect_timeout_ms = 300;
        config.fallback_to_local = fallback_to_local;
        config
    }

    #[tokio::test]
    async fn local_mode_never_touches_redis() {
        let mut config = AppConfig::default().kv;
        config.mode = KvMode::Local;

        let store = connect_key_value_store(&config).await.expect("local store");
        assert_eq!(store.backend(), "local");
    }

    #[tokio::test]
    async fn unreachable_redis_is_fatal_without_fallback() {
        let result = connect_key_value_store(&unreachable_redis(false)).await;

        assert!(matches!(
            result,
            Err(StoreError::Unavailable { .. }) | Err(StoreError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_redis_falls_back_when_allowed() {
        let store = connect_key_value_store(&unreachable_redis(true)).await.expect("fallback");

        assert_eq!(store.backend(), "local");
        store.set("k", "v", None).await.expect("set");
        assert_eq!(store.get("k").await.expect("get"), Some("v".to_string()));
    }
}
