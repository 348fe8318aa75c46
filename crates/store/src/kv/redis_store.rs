use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, RedisResult, Script};
use switchboard_core::config::KvConfig;

use super::KeyValueStore;
use crate::errors::StoreError;

const BACKEND: &str = "redis";

const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

pub struct RedisKeyValueStore {
    manager: ConnectionManager,
    key_prefix: String,
    op_timeout: Duration,
    delete_if_equals: Script,
}

impl RedisKeyValueStore {
    /// Connects and verifies the server answers `PING` within the connect timeout.
    pub async fn connect(config: &KvConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())?;
        let connect_timeout_ms = config.connect_timeout_ms;
        let manager = tokio::time::timeout(
            Duration::from_millis(connect_timeout_ms),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| StoreError::Timeout {
            backend: BACKEND,
            operation: "connect",
            timeout_ms: connect_timeout_ms,
        })??;

        let store = Self {
            manager,
            key_prefix: config.key_prefix.clone(),
            op_timeout: Duration::from_millis(config.op_timeout_ms),
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
        };
        store.ping().await?;
        Ok(store)
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn bounded<T, F>(&self, operation: &'static str, future: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, future).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout {
                backend: BACKEND,
                operation,
                timeout_ms: u64::try_from(self.op_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        let key = self.key(key);
        self.bounded("get", async move {
            let value: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
            Ok::<_, RedisError>(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let mut command = redis::cmd("SET");
        command.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            command.arg("PX").arg(ttl_millis(ttl));
        }
        self.bounded("set", async move {
            let _: () = command.query_async(&mut conn).await?;
            Ok::<_, RedisError>(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let key = self.key(key);
        self.bounded("delete", async move {
            let _: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
            Ok::<_, RedisError>(())
        })
        .await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let mut command = redis::cmd("SET");
        command.arg(self.key(key)).arg(value).arg("NX").arg("PX").arg(ttl_millis(ttl));
        self.bounded("set_if_absent", async move {
            let reply: Option<String> = command.query_async(&mut conn).await?;
            Ok::<_, RedisError>(reply.is_some())
        })
        .await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let mut invocation = self.delete_if_equals.prepare_invoke();
        invocation.key(self.key(key)).arg(expected);
        self.bounded("delete_if_equals", async move {
            let deleted: i64 = invocation.invoke_async(&mut conn).await?;
            Ok::<_, RedisError>(deleted == 1)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        self.bounded("ping", async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, RedisError>(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use switchboard_core::config::{AppConfig, KvMode};

    use super::RedisKeyValueStore;
    use crate::kv::KeyValueStore;

    /// Runs only when `SWITCHBOARD_TEST_REDIS_URL` points at a disposable server.
    async fn live_store() -> Option<RedisKeyValueStore> {
        let url = std::env::var("SWITCHBOARD_TEST_REDIS_URL").ok()?;
        let mut config = AppConfig::default().kv;
        config.mode = KvMode::Redis;
        config.url = url;
        config.key_prefix = format!("switchboard-test:{}:", std::process::id());
        Some(RedisKeyValueStore::connect(&config).await.expect("connect to test redis"))
    }

    #[tokio::test]
    async fn lease_primitives_against_live_redis() {
        let Some(store) = live_store().await else {
            return;
        };

        store.delete("lock:chat:live").await.expect("reset");
        let lease = Duration::from_secs(5);
        assert!(store.set_if_absent("lock:chat:live", "a", lease).await.expect("acquire"));
        assert!(!store.set_if_absent("lock:chat:live", "b", lease).await.expect("contend"));
        assert!(!store.delete_if_equals("lock:chat:live", "b").await.expect("foreign release"));
        assert!(store.delete_if_equals("lock:chat:live", "a").await.expect("own release"));
        assert!(store.get("lock:chat:live").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn values_round_trip_with_ttl_against_live_redis() {
        let Some(store) = live_store().await else {
            return;
        };

        store.set("config:tenant:live", "{}", Some(Duration::from_secs(30))).await.expect("set");
        assert_eq!(store.get("config:tenant:live").await.expect("get"), Some("{}".to_string()));
        store.delete("config:tenant:live").await.expect("delete");
        assert!(store.get("config:tenant:live").await.expect("get").is_none());
    }
}
