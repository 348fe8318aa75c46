use std::sync::Arc;
use std::time::Duration;

use switchboard_core::config::{AppConfig, ConfigError, LoadOptions};
use switchboard_core::CoordinationError;
use switchboard_runtime::Coordinator;
use switchboard_store::{
    connect_from_config, connect_key_value_store, migrations, DbPool, SqlDocumentStore, StoreError,
};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub coordinator: Arc<Coordinator>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("key-value store connection failed: {0}")]
    KeyValueStore(#[source] StoreError),
    #[error("coordinator setup failed: {0}")]
    Coordinator(#[source] CoordinationError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let kv = connect_key_value_store(&config.kv).await.map_err(BootstrapError::KeyValueStore)?;
    info!(
        event_name = "system.bootstrap.kv_connected",
        backend = kv.backend(),
        "key-value store ready"
    );

    let records = Arc::new(
        SqlDocumentStore::new(db_pool.clone(), config.database.collection_prefix.clone())
            .with_watch_interval(Duration::from_millis(config.tenant_config.watch_interval_ms)),
    );

    let coordinator = Coordinator::builder(config.clone(), kv, records)
        .build()
        .map_err(BootstrapError::Coordinator)?;
    coordinator.start_workers().await.map_err(BootstrapError::Coordinator)?;
    info!(
        event_name = "system.bootstrap.coordinator_started",
        workers = coordinator.worker_count(),
        "coordinator started"
    );

    Ok(Application { config, db_pool, coordinator: Arc::new(coordinator) })
}

#[cfg(test)]
mod tests {
    use switchboard_core::config::{ConfigOverrides, KvMode, LoadOptions};
    use switchboard_core::{ConversationId, Reply};

    use crate::bootstrap::{bootstrap, BootstrapError};

    fn local_overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                kv_mode: Some(KvMode::Local),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_invalid_token_url() {
        let mut options = local_overrides("sqlite::memory:");
        options.overrides.oauth_token_url = Some("oauth.example.com/token".to_string());

        let result = bootstrap(options).await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("oauth.token_url"));
    }

    #[tokio::test]
    async fn bootstrap_fails_when_redis_is_unreachable() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                kv_mode: Some(KvMode::Redis),
                kv_url: Some("redis://127.0.0.1:1/0".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        assert!(matches!(result, Err(BootstrapError::KeyValueStore(_))));
    }

    #[tokio::test]
    async fn bootstrap_wires_storage_and_coordinator() {
        let app = bootstrap(local_overrides("sqlite::memory:?cache=shared"))
            .await
            .expect("bootstrap should succeed with local kv");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('documents', 'document_changes')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("document tables should exist after bootstrap");
        assert_eq!(table_count, 2);
        assert_eq!(app.coordinator.worker_count(), 2);

        let reply = app
            .coordinator
            .conversations()
            .handle(&ConversationId::from("chat-1"), "hello", None)
            .await;
        assert!(matches!(reply, Reply::Apology(_)), "unknown tenant is answered with an apology");

        app.coordinator.shutdown().await;
        app.db_pool.close().await;
    }
}
