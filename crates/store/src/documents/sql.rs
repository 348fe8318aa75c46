use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteArguments;
use sqlx::query::Query;
use sqlx::{Row, Sqlite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Collection, Document, DocumentChange, FieldFilter, SourceOfRecord};
use crate::errors::StoreError;
use crate::DbPool;

const CHANGE_BUFFER: usize = 256;
/// Change rows older than this are purged; every live watcher has long since read them.
pub const CHANGE_LOG_RETENTION: Duration = Duration::from_secs(3_600);
const CHANGE_LOG_PURGE_INTERVAL: Duration = Duration::from_secs(300);

/// SQLite-backed source of record. Documents live in one table keyed by
/// `(collection, id)`; triggers feed `document_changes`, which watchers tail.
pub struct SqlDocumentStore {
    pool: DbPool,
    collection_prefix: String,
    watch_interval: Duration,
}

impl SqlDocumentStore {
    pub fn new(pool: DbPool, collection_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            collection_prefix: collection_prefix.into(),
            watch_interval: Duration::from_secs(1),
        }
    }

    pub fn with_watch_interval(mut self, watch_interval: Duration) -> Self {
        self.watch_interval = watch_interval;
        self
    }

    fn name(&self, collection: Collection) -> String {
        collection.qualified_name(&self.collection_prefix)
    }

    /// Deletes change-feed rows recorded more than `older_than` ago. Returns how many went.
    pub async fn purge_change_log(&self, older_than: Duration) -> Result<u64, StoreError> {
        purge_change_log(&self.pool, older_than).await
    }
}

async fn purge_change_log(pool: &DbPool, older_than: Duration) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "DELETE FROM document_changes
         WHERE changed_at < strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ?)",
    )
    .bind(format!("-{} seconds", older_than.as_secs()))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

fn decode_body(raw: &str) -> Result<Document, StoreError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(document) => Ok(document),
        other => Err(StoreError::Decode(format!("document body is not an object: {other}"))),
    }
}

fn bind_filter<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    filter: &FieldFilter,
) -> Result<Query<'q, Sqlite, SqliteArguments<'q>>, StoreError> {
    let query = query.bind(json_path(&filter.field));
    match &filter.equals {
        Value::Null => Ok(query),
        Value::Bool(value) => Ok(query.bind(i64::from(*value))),
        Value::Number(number) => match (number.as_i64(), number.as_f64()) {
            (Some(value), _) => Ok(query.bind(value)),
            (None, Some(value)) => Ok(query.bind(value)),
            (None, None) => Err(StoreError::Decode(format!("unsupported number filter {number}"))),
        },
        Value::String(value) => Ok(query.bind(value.clone())),
        other => Err(StoreError::Decode(format!(
            "filter on `{}` must compare against a scalar, got {other}",
            filter.field
        ))),
    }
}

#[async_trait]
impl SourceOfRecord for SqlDocumentStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get_document(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND id = ?")
            .bind(self.name(collection))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| decode_body(&row.try_get::<String, _>("body")?)).transpose()
    }

    async fn set_document(
        &self,
        collection: Collection,
        id: &str,
        document: Document,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_string(&Value::Object(document))?;
        sqlx::query(
            "INSERT INTO documents (collection, id, body, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(collection, id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at",
        )
        .bind(self.name(collection))
        .bind(id)
        .bind(body)
        .bind(timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_document(
        &self,
        collection: Collection,
        id: &str,
        fields: Document,
    ) -> Result<(), StoreError> {
        let (removed, replaced): (Vec<_>, Vec<_>) =
            fields.into_iter().partition(|(_, value)| value.is_null());

        // Top-level only: nested objects are replaced whole, never deep-merged.
        let mut body = String::from("body");
        if !replaced.is_empty() {
            body = format!("json_set({body}{})", ", ?, json(?)".repeat(replaced.len()));
        }
        if !removed.is_empty() {
            body = format!("json_remove({body}{})", ", ?".repeat(removed.len()));
        }
        let sql = format!(
            "UPDATE documents SET body = {body}, updated_at = ? WHERE collection = ? AND id = ?"
        );

        let mut query = sqlx::query(&sql);
        for (field, value) in &replaced {
            query = query.bind(json_path(field)).bind(serde_json::to_string(value)?);
        }
        for (field, _) in &removed {
            query = query.bind(json_path(field));
        }
        let result = query
            .bind(timestamp())
            .bind(self.name(collection))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { collection: self.name(collection), id: id.to_string() });
        }
        Ok(())
    }

    async fn delete_document(&self, collection: Collection, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(self.name(collection))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query_one(
        &self,
        collection: Collection,
        filters: &[FieldFilter],
    ) -> Result<Option<(String, Document)>, StoreError> {
        let mut sql = String::from("SELECT id, body FROM documents WHERE collection = ?");
        for filter in filters {
            if filter.equals.is_null() {
                sql.push_str(" AND COALESCE(json_type(body, ?), 'null') = 'null'");
            } else {
                sql.push_str(" AND json_extract(body, ?) = ?");
            }
        }
        sql.push_str(" ORDER BY updated_at DESC, rowid DESC LIMIT 1");

        let mut query = sqlx::query(&sql).bind(self.name(collection));
        for filter in filters {
            query = bind_filter(query, filter)?;
        }

        let row = query.fetch_optional(&self.pool).await?;
        row.map(|row| {
            let id = row.try_get::<String, _>("id")?;
            let body = decode_body(&row.try_get::<String, _>("body")?)?;
            Ok::<_, StoreError>((id, body))
        })
        .transpose()
    }

    async fn subscribe(
        &self,
        collection: Collection,
    ) -> Result<mpsc::Receiver<DocumentChange>, StoreError> {
        let name = self.name(collection);
        let mut watermark = sqlx::query(
            "SELECT COALESCE(MAX(seq), 0) AS seq FROM document_changes WHERE collection = ?",
        )
        .bind(&name)
        .fetch_one(&self.pool)
        .await?
        .try_get::<i64, _>("seq")?;

        let (sender, receiver) = mpsc::channel(CHANGE_BUFFER);
        let pool = self.pool.clone();
        let mut interval = tokio::time::interval(self.watch_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_purge = tokio::time::Instant::now();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sender.closed() => break,
                    _ = interval.tick() => {}
                }

                if last_purge.elapsed() >= CHANGE_LOG_PURGE_INTERVAL {
                    last_purge = tokio::time::Instant::now();
                    match purge_change_log(&pool, CHANGE_LOG_RETENTION).await {
                        Ok(purged) => debug!(event_name = "store.documents.change_log_purged", purged),
                        Err(error) => warn!(
                            event_name = "store.documents.change_log_purge_failed",
                            error = %error,
                            "change log purge failed; retrying later"
                        ),
                    }
                }

                let rows = sqlx::query(
                    "SELECT seq, document_id FROM document_changes
                     WHERE collection = ? AND seq > ?
                     ORDER BY seq ASC",
                )
                .bind(&name)
                .bind(watermark)
                .fetch_all(&pool)
                .await;

                let rows = match rows {
                    Ok(rows) => rows,
                    Err(error) => {
                        warn!(
                            event_name = "store.documents.watch_failed",
                            collection = %name,
                            error = %error,
                            "document change poll failed; retrying on next tick"
                        );
                        continue;
                    }
                };

                for row in rows {
                    let seq = row.try_get::<i64, _>("seq");
                    let id = row.try_get::<String, _>("document_id");
                    let (Ok(seq), Ok(id)) = (seq, id) else {
                        continue;
                    };
                    watermark = watermark.max(seq);
                    debug!(event_name = "store.documents.changed", collection = %name, document_id = %id);
                    if sender.send(DocumentChange { collection, id }).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(receiver)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::SqlDocumentStore;
    use crate::documents::{Collection, Document, FieldFilter, SourceOfRecord};
    use crate::errors::StoreError;
    use crate::{connect_with_settings, migrations};

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn setup_store(prefix: &str) -> SqlDocumentStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlDocumentStore::new(pool, prefix).with_watch_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn documents_round_trip_and_merge() {
        let store = setup_store("").await;
        store
            .set_document(
                Collection::Installations,
                "acme",
                doc(json!({"domain": "acme.example.com", "accessToken": "a", "expiresAt": 1})),
            )
            .await
            .expect("set");
        store
            .update_document(
                Collection::Installations,
                "acme",
                doc(json!({"accessToken": "b", "expiresAt": 2})),
            )
            .await
            .expect("update");

        let stored = store.get_document(Collection::Installations, "acme").await.expect("get");
        assert_eq!(
            stored,
            Some(doc(json!({"domain": "acme.example.com", "accessToken": "b", "expiresAt": 2})))
        );

        let missing =
            store.update_document(Collection::Installations, "nobody", doc(json!({"a": 1}))).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn update_replaces_nested_objects_and_drops_null_fields() {
        let store = setup_store("").await;
        store
            .set_document(
                Collection::Settings,
                "ai",
                doc(json!({"limits": {"daily": 10, "burst": 2}, "model": "m", "role": "r"})),
            )
            .await
            .expect("set");
        store
            .update_document(
                Collection::Settings,
                "ai",
                doc(json!({"limits": {"daily": 20}, "role": null, "tags": ["a"]})),
            )
            .await
            .expect("update");

        let stored = store.get_document(Collection::Settings, "ai").await.expect("get");
        assert_eq!(
            stored,
            Some(doc(json!({"limits": {"daily": 20}, "model": "m", "tags": ["a"]})))
        );
    }

    #[tokio::test]
    async fn purge_drops_only_aged_change_rows() {
        let store = setup_store("").await;
        for id in ["old-1", "old-2", "fresh"] {
            store
                .set_document(Collection::Installations, id, doc(json!({"domain": id})))
                .await
                .expect("seed");
        }
        sqlx::query(
            "UPDATE document_changes SET changed_at = '2000-01-01T00:00:00.000Z'
             WHERE document_id IN ('old-1', 'old-2')",
        )
        .execute(&store.pool)
        .await
        .expect("age rows");

        let purged = store.purge_change_log(super::CHANGE_LOG_RETENTION).await.expect("purge");

        assert_eq!(purged, 2);
        let remaining = sqlx::query_scalar::<_, String>("SELECT document_id FROM document_changes")
            .fetch_all(&store.pool)
            .await
            .expect("remaining rows");
        assert_eq!(remaining, vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn prefix_isolates_environments() {
        let store = setup_store("test_").await;
        store
            .set_document(Collection::Secrets, "acme", doc(json!({"clientId": "id"})))
            .await
            .expect("set");

        let unprefixed = SqlDocumentStore::new(store.pool.clone(), "");
        assert!(unprefixed.get_document(Collection::Secrets, "acme").await.expect("get").is_none());
        assert!(store.get_document(Collection::Secrets, "acme").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn query_one_filters_on_json_fields() {
        let store = setup_store("").await;
        store
            .set_document(
                Collection::Agents,
                "inactive",
                doc(json!({"tenantId": "acme", "isActive": false, "model": "old"})),
            )
            .await
            .expect("seed inactive");
        store
            .set_document(
                Collection::Agents,
                "active",
                doc(json!({"tenantId": "acme", "isActive": true, "model": "new"})),
            )
            .await
            .expect("seed active");
        store
            .set_document(
                Collection::Agents,
                "other",
                doc(json!({"tenantId": "globex", "isActive": true})),
            )
            .await
            .expect("seed other tenant");

        let filters =
            [FieldFilter::new("tenantId", "acme"), FieldFilter::new("isActive", true)];
        let (id, agent) = store
            .query_one(Collection::Agents, &filters)
            .await
            .expect("query")
            .expect("active agent");

        assert_eq!(id, "active");
        assert_eq!(agent.get("model"), Some(&json!("new")));
    }

    #[tokio::test]
    async fn watchers_see_changes_after_subscription() {
        let store = setup_store("").await;
        store
            .set_document(Collection::Secrets, "before", doc(json!({"clientId": "old"})))
            .await
            .expect("pre-existing write");

        let mut changes = store.subscribe(Collection::Secrets).await.expect("subscribe");
        store
            .set_document(Collection::Settings, "ai", doc(json!({"model": "m"})))
            .await
            .expect("other collection");
        store
            .set_document(Collection::Secrets, "acme", doc(json!({"clientId": "new"})))
            .await
            .expect("watched write");

        let change = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .expect("change before timeout")
            .expect("open feed");
        assert_eq!(change.collection, Collection::Secrets);
        assert_eq!(change.id, "acme");
    }
}
