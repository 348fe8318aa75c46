use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use switchboard_core::TenantId;
use switchboard_store::{Collection, SourceOfRecord};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::session::SessionRegistry;
use crate::tenant_config::TenantConfigCache;

/// Stop signal handed to a worker body.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once stop is requested or the worker handle is gone.
    pub async fn cancelled(&mut self) {
        let _ = self.receiver.wait_for(|stop| *stop).await;
    }
}

/// A named background task with an explicit stop.
pub struct BackgroundWorker {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundWorker {
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, receiver) = watch::channel(false);
        let task = body(ShutdownSignal { receiver });
        let handle = tokio::spawn(task);
        info!(event_name = "runtime.worker.started", worker = name);
        Self { name, shutdown, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        match self.handle.await {
            Ok(()) => info!(event_name = "runtime.worker.stopped", worker = self.name),
            Err(join_error) => error!(
                event_name = "runtime.worker.crashed",
                worker = self.name,
                error = %join_error,
                "worker ended abnormally"
            ),
        }
    }
}

/// Closes idle sessions every `interval`.
pub fn spawn_session_sweeper(registry: Arc<SessionRegistry>, interval: Duration) -> BackgroundWorker {
    BackgroundWorker::spawn("session-sweeper", move |mut shutdown| async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    registry.sweep_expired().await;
                }
            }
        }
    })
}

/// Invalidates a tenant's cached config whenever its secrets document changes.
pub async fn spawn_config_invalidator(
    records: Arc<dyn SourceOfRecord>,
    tenant_configs: Arc<TenantConfigCache>,
) -> Result<BackgroundWorker, switchboard_store::StoreError> {
    let mut changes = records.subscribe(Collection::Secrets).await?;

    Ok(BackgroundWorker::spawn("config-invalidator", move |mut shutdown| async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                change = changes.recv() => {
                    let Some(change) = change else {
                        warn!(
                            event_name = "config.watch.feed_closed",
                            "secrets change feed ended; tenant config relies on cache ttl"
                        );
                        break;
                    };
                    let tenant_id = TenantId::new(change.id);
                    if let Err(failure) = tenant_configs.invalidate(&tenant_id).await {
                        error!(
                            event_name = "config.watch.invalidate_failed",
                            tenant_id = %tenant_id,
                            error = %failure,
                            "stale tenant config may be served until ttl"
                        );
                    }
                }
            }
        }
    }))
}
