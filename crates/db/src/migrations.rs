use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::{run_pending, MIGRATOR};
    use crate::connect_with_settings;

    const MANAGED_TABLES: &[&str] = &[
        "clients",
        "policies",
        "crm_stages",
        "crm_deals",
        "appointments",
        "financial_entries",
        "ai_conversations",
        "ai_messages",
        "ai_operations_log",
    ];

    #[tokio::test]
    async fn migrations_create_baseline_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        for table in MANAGED_TABLES {
            let count = sqlx::query(
                "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?1",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .expect("check table")
            .get::<i64, _>("count");
            assert_eq!(count, 1, "table {table} should exist after migrations");
        }
    }

    #[tokio::test]
    async fn migrations_are_reversible() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        for table in MANAGED_TABLES {
            let count = sqlx::query(
                "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?1",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .expect("check table removed")
            .get::<i64, _>("count");
            assert_eq!(count, 0, "table {table} should be removed after full undo");
        }
    }

    #[tokio::test]
    async fn one_in_progress_message_per_conversation_is_enforced() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        sqlx::query(
            "INSERT INTO ai_conversations (id, user_id, title, created_at, updated_at) \
             VALUES ('c1', 'u1', 't', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("insert conversation");

        let insert_in_progress = "INSERT INTO ai_messages \
            (id, conversation_id, role, content, in_progress, created_at) \
            VALUES (?1, 'c1', 'assistant', '', 1, '2026-01-01T00:00:00Z')";

        sqlx::query(insert_in_progress).bind("m1").execute(&pool).await.expect("first in-progress");
        let second = sqlx::query(insert_in_progress).bind("m2").execute(&pool).await;
        assert!(second.is_err(), "second in-progress message must violate the partial index");
    }
}
