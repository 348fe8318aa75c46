use std::sync::Arc;
use std::time::Duration;

use switchboard_core::{BusyReason, ConversationId, CoordinationError};
use switchboard_store::{KeyValueStore, LockLease};
use tracing::{debug, warn};

use crate::keys;

/// Per-conversation mutual exclusion across every process sharing the store.
pub struct DistributedLock {
    kv: Arc<dyn KeyValueStore>,
    lease: Duration,
    wait: Duration,
    poll: Duration,
}

impl DistributedLock {
    pub fn new(kv: Arc<dyn KeyValueStore>, lease: Duration, wait: Duration, poll: Duration) -> Self {
        Self { kv, lease, wait, poll }
    }

    /// Waits up to the configured bound. Contention and an unreachable store
    /// both surface as [`CoordinationError::Busy`].
    pub async fn acquire(&self, conversation_id: &ConversationId) -> Result<LockGuard, CoordinationError> {
        let key = keys::conversation_lock(conversation_id);
        let busy = |reason| CoordinationError::Busy { conversation_id: conversation_id.clone(), reason };

        match self.kv.acquire_lock(&key, self.lease, self.wait, self.poll).await {
            Ok(Some(lease)) => Ok(LockGuard { kv: Arc::clone(&self.kv), lease, released: false }),
            Ok(None) => {
                debug!(
                    event_name = "session.lock.contended",
                    conversation_id = %conversation_id,
                    wait_ms = u64::try_from(self.wait.as_millis()).unwrap_or(u64::MAX),
                    "lock held past the wait bound"
                );
                Err(busy(BusyReason::Contention))
            }
            Err(error) => {
                warn!(
                    event_name = "session.lock.store_unavailable",
                    conversation_id = %conversation_id,
                    error = %error,
                    "cannot prove exclusivity; refusing to process"
                );
                Err(busy(BusyReason::LockStoreUnavailable))
            }
        }
    }
}

/// Held conversation lock. Dropping it without [`LockGuard::release`]
/// schedules the release on the current runtime.
#[must_use = "the lock is released when the guard is released or dropped"]
pub struct LockGuard {
    kv: Arc<dyn KeyValueStore>,
    lease: LockLease,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.lease.key
    }

    pub async fn release(mut self) {
        self.released = true;
        release_lease(self.kv.as_ref(), &self.lease).await;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                event_name = "session.lock.release_skipped",
                key = %self.lease.key,
                "no runtime to release on; lease will expire"
            );
            return;
        };
        let kv = Arc::clone(&self.kv);
        let lease = self.lease.clone();
        handle.spawn(async move {
            release_lease(kv.as_ref(), &lease).await;
        });
    }
}

async fn release_lease(kv: &dyn KeyValueStore, lease: &LockLease) {
    match kv.release_lock(lease).await {
        Ok(true) => debug!(event_name = "session.lock.released", key = %lease.key),
        Ok(false) => warn!(
            event_name = "session.lock.lease_lost",
            key = %lease.key,
            "lease expired or was taken over before release"
        ),
        Err(error) => warn!(
            event_name = "session.lock.release_failed",
            key = %lease.key,
            error = %error,
            "lock release failed; lease will expire"
        ),
    }
}
