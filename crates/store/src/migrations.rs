use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::run_pending;
    use crate::{connect_with_settings, migrations::MIGRATOR};

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "documents",
        "document_changes",
        "idx_documents_collection_updated_at",
        "idx_document_changes_collection_seq",
        "idx_document_changes_changed_at",
        "documents_after_insert",
        "documents_after_update",
        "documents_after_delete",
    ];

    async fn schema_object_count(pool: &crate::DbPool) -> i64 {
        let placeholders = vec!["?"; MANAGED_SCHEMA_OBJECTS.len()].join(", ");
        let sql = format!(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE name IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for name in MANAGED_SCHEMA_OBJECTS {
            query = query.bind(*name);
        }
        query.fetch_one(pool).await.expect("count schema objects").get::<i64, _>("count")
    }

    #[tokio::test]
    async fn migrations_create_document_tables_and_triggers() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        assert_eq!(schema_object_count(&pool).await, MANAGED_SCHEMA_OBJECTS.len() as i64);
    }

    #[tokio::test]
    async fn rerunning_migrations_is_a_no_op() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("first run");
        run_pending(&pool).await.expect("second run is a no-op");

        let applied = sqlx::query("SELECT COUNT(*) AS count FROM _sqlx_migrations")
            .fetch_one(&pool)
            .await
            .expect("count applied migrations")
            .get::<i64, _>("count");
        assert_eq!(applied, MIGRATOR.iter().count() as i64);
    }

    #[tokio::test]
    async fn writes_append_to_change_feed() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        sqlx::query(
            "INSERT INTO documents (collection, id, body, updated_at) VALUES ('secrets', 'acme', '{}', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("insert document");
        sqlx::query("DELETE FROM documents WHERE collection = 'secrets' AND id = 'acme'")
            .execute(&pool)
            .await
            .expect("delete document");

        let operations: Vec<String> =
            sqlx::query("SELECT operation FROM document_changes ORDER BY seq")
                .fetch_all(&pool)
                .await
                .expect("read change feed")
                .into_iter()
                .map(|row| row.get::<String, _>("operation"))
                .collect();
        assert_eq!(operations, vec!["insert".to_string(), "delete".to_string()]);
    }
}
