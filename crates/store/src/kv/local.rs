use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::KeyValueStore;
use crate::errors::StoreError;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// Process-local store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct LocalKeyValueStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl LocalKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|entry| entry.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyValueStore for LocalKeyValueStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), Entry { value: value.to_string(), expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }

        entries
            .insert(key.to_string(), Entry { value: value.to_string(), expires_at: now.checked_add(ttl) });
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let matches =
            entries.get(key).is_some_and(|entry| entry.is_live(now) && entry.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::LocalKeyValueStore;
    use crate::kv::KeyValueStore;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = LocalKeyValueStore::new();
        store.set("config:tenant:acme", "{}", Some(Duration::from_secs(3_600))).await.expect("set");

        tokio::time::advance(Duration::from_secs(3_599)).await;
        assert!(store.get("config:tenant:acme").await.expect("get").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("config:tenant:acme").await.expect("get").is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_is_exclusive_until_lease_expires() {
        let store = LocalKeyValueStore::new();
        let lease = Duration::from_secs(120);

        assert!(store.set_if_absent("lock:chat:1", "a", lease).await.expect("first"));
        assert!(!store.set_if_absent("lock:chat:1", "b", lease).await.expect("second"));

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(store.set_if_absent("lock:chat:1", "b", lease).await.expect("after expiry"));
    }

    #[tokio::test]
    async fn delete_if_equals_only_removes_own_value() {
        let store = LocalKeyValueStore::new();
        store.set_if_absent("lock:chat:1", "owner", Duration::from_secs(60)).await.expect("set");

        assert!(!store.delete_if_equals("lock:chat:1", "intruder").await.expect("foreign"));
        assert_eq!(store.get("lock:chat:1").await.expect("get"), Some("owner".to_string()));
        assert!(store.delete_if_equals("lock:chat:1", "owner").await.expect("own"));
        assert!(store.get("lock:chat:1").await.expect("get").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_lock_times_out_while_held() {
        let store = LocalKeyValueStore::new();
        let lease = Duration::from_secs(120);
        let poll = Duration::from_millis(100);

        let held = store
            .acquire_lock("lock:chat:1", lease, Duration::ZERO, poll)
            .await
            .expect("acquire")
            .expect("free lock");

        let started = tokio::time::Instant::now();
        let contended = store
            .acquire_lock("lock:chat:1", lease, Duration::from_secs(2), poll)
            .await
            .expect("poll");
        assert!(contended.is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));

        assert!(store.release_lock(&held).await.expect("release"));
        assert!(!store.release_lock(&held).await.expect("second release is a no-op"));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_waits_and_leases_stay_bounded() {
        let store = LocalKeyValueStore::new();
        let poll = Duration::from_secs(10);

        let held = store
            .acquire_lock("lock:chat:1", Duration::MAX, Duration::ZERO, poll)
            .await
            .expect("acquire")
            .expect("free lock");

        let started = tokio::time::Instant::now();
        let contended = store
            .acquire_lock("lock:chat:1", Duration::from_secs(120), Duration::from_secs(u64::MAX / 2), poll)
            .await
            .expect("poll");
        assert!(contended.is_none());
        assert!(started.elapsed() <= crate::kv::MAX_LOCK_WAIT + Duration::from_secs(1));

        store.set("big-ttl", "v", Some(Duration::MAX)).await.expect("set");
        assert_eq!(store.get("big-ttl").await.expect("get").as_deref(), Some("v"));
        assert!(store.release_lock(&held).await.expect("release"));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_lock_once_holder_releases() {
        let store = std::sync::Arc::new(LocalKeyValueStore::new());
        let lease = Duration::from_secs(120);
        let poll = Duration::from_millis(100);
        let held = store
            .acquire_lock("lock:chat:1", lease, Duration::ZERO, poll)
            .await
            .expect("acquire")
            .expect("free lock");

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store.acquire_lock("lock:chat:1", lease, Duration::from_secs(60), poll).await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        store.release_lock(&held).await.expect("release");

        let acquired = waiter.await.expect("join").expect("poll").expect("lock after release");
        assert_ne!(acquired.token, held.token);
    }
}
