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
    use crate::{connect_with_settings, migrations::MIGRATOR, DbPool};

    const MANAGED_TABLES: &[&str] =
        &["contact", "exchange", "conversation_turn", "execution_task", "worker_identity"];

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "contact",
        "exchange",
        "conversation_turn",
        "execution_task",
        "worker_identity",
        "idx_exchange_contact_id",
        "idx_exchange_state",
        "idx_exchange_one_active_per_contact",
        "idx_conversation_turn_exchange_id",
        "idx_execution_task_exchange_id",
        "idx_execution_task_status",
        "idx_worker_identity_status",
    ];

    #[tokio::test]
    async fn migrations_create_baseline_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        for table in MANAGED_TABLES {
            assert_eq!(table_count(&pool, table).await, 1, "missing table `{table}`");
        }
    }

    #[tokio::test]
    async fn migrations_are_reversible() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        for table in MANAGED_TABLES {
            assert_eq!(table_count(&pool, table).await, 0, "table `{table}` survived undo");
        }
    }

    #[tokio::test]
    async fn second_active_exchange_for_a_contact_is_rejected_by_schema() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");
        let ts = "2026-03-01T10:00:00Z";

        sqlx::query(
            "INSERT INTO contact (contact_id, display_name, first_seen, last_seen, reliability_score)
             VALUES ('c-1', 'Ada', ?, ?, 0.5)",
        )
        .bind(ts)
        .bind(ts)
        .execute(&pool)
        .await
        .expect("insert contact");

        let insert = |exchange_id: &'static str, state: &'static str| {
            sqlx::query(
                "INSERT INTO exchange (
                    exchange_id, contact_id, state, created_at,
                    our_fulfillment_status, their_fulfillment_status
                 ) VALUES (?, 'c-1', ?, ?, 'pending', 'pending')",
            )
            .bind(exchange_id)
            .bind(state)
            .bind(ts)
        };

        insert("EX-1", "completed").execute(&pool).await.expect("terminal exchange");
        insert("EX-2", "negotiating").execute(&pool).await.expect("first active exchange");
        let duplicate = insert("EX-3", "contacted").execute(&pool).await;

        assert!(duplicate.is_err(), "second active exchange must violate the partial index");
    }

    #[tokio::test]
    async fn migrations_up_down_up_preserves_schema_signature() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let initial_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            initial_signature.len(),
            MANAGED_SCHEMA_OBJECTS.len(),
            "initial migration pass should create all managed schema objects",
        );

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        let after_down_signature = managed_schema_signature(&pool).await;
        assert!(
            after_down_signature.is_empty(),
            "managed schema objects should be removed after full undo",
        );

        run_pending(&pool).await.expect("re-run migrations");

        let after_second_up_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            after_second_up_signature, initial_signature,
            "up/down/up should preserve migration-managed schema signature",
        );
    }

    async fn table_count(pool: &DbPool, table: &str) -> i64 {
        sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(pool)
        .await
        .expect("query sqlite_master")
        .get::<i64, _>("count")
    }

    async fn managed_schema_signature(pool: &DbPool) -> Vec<(String, String, String)> {
        let mut signature: Vec<(String, String, String)> = sqlx::query(
            "SELECT type, name, IFNULL(sql, '') AS sql
             FROM sqlite_master
             WHERE type IN ('table', 'index')",
        )
        .fetch_all(pool)
        .await
        .expect("load schema objects")
        .into_iter()
        .filter_map(|row| {
            let name = row.get::<String, _>("name");
            if MANAGED_SCHEMA_OBJECTS.contains(&name.as_str()) {
                Some((row.get::<String, _>("type"), name, row.get::<String, _>("sql")))
            } else {
                None
            }
        })
        .collect();
        signature.sort();
        signature
    }
}
