use sqlx::{sqlite::SqliteRow, Executor, Row, Sqlite};

use tradeback_core::domain::exchange::{ActionType, ExchangeId};
use tradeback_core::domain::execution::{ErrorKind, ExecutionTask, TaskId, TaskStatus};
use tradeback_core::domain::worker::WorkerId;

use super::{parse_enum, parse_timestamp, parse_u32, ExecutionTaskRepository, RepositoryError};
use crate::DbPool;

const TASK_COLUMNS: &str = "task_id,
    exchange_id,
    action_type,
    target_reference,
    quantity,
    required,
    assigned_worker_identity,
    status,
    attempt_count,
    max_attempts,
    last_error,
    last_error_kind,
    available_at,
    created_at,
    updated_at";

pub struct SqlExecutionTaskRepository {
    pool: DbPool,
}

impl SqlExecutionTaskRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ExecutionTaskRepository for SqlExecutionTaskRepository {
    async fn find_by_id(&self, id: &TaskId) -> Result<Option<ExecutionTask>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM execution_task WHERE task_id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(task_from_row).transpose()
    }

    async fn list_for_exchange(
        &self,
        exchange_id: &ExchangeId,
    ) -> Result<Vec<ExecutionTask>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS}
             FROM execution_task
             WHERE exchange_id = ?
             ORDER BY created_at ASC, task_id ASC"
        ))
        .bind(&exchange_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(task_from_row).collect()
    }

    async fn save(&self, task: ExecutionTask) -> Result<(), RepositoryError> {
        upsert_task(&self.pool, &task).await
    }

    async fn save_all(&self, tasks: Vec<ExecutionTask>) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        for task in &tasks {
            upsert_task(&mut *tx, task).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_task<'e, E>(executor: E, task: &ExecutionTask) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO execution_task (
            task_id,
            exchange_id,
            action_type,
            target_reference,
            quantity,
            required,
            assigned_worker_identity,
            status,
            attempt_count,
            max_attempts,
            last_error,
            last_error_kind,
            available_at,
            created_at,
            updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(task_id) DO UPDATE SET
            assigned_worker_identity = excluded.assigned_worker_identity,
            status = excluded.status,
            attempt_count = excluded.attempt_count,
            max_attempts = excluded.max_attempts,
            last_error = excluded.last_error,
            last_error_kind = excluded.last_error_kind,
            available_at = excluded.available_at,
            updated_at = excluded.updated_at",
    )
    .bind(&task.task_id.0)
    .bind(&task.exchange_id.0)
    .bind(task.action_type.as_str())
    .bind(&task.target_reference)
    .bind(i64::from(task.quantity))
    .bind(task.required)
    .bind(task.assigned_worker_identity.as_ref().map(|worker| worker.0.as_str()))
    .bind(task.status.as_str())
    .bind(i64::from(task.attempt_count))
    .bind(i64::from(task.max_attempts))
    .bind(task.last_error.as_deref())
    .bind(task.last_error_kind.map(|kind| kind.as_str()))
    .bind(task.available_at.to_rfc3339())
    .bind(task.created_at.to_rfc3339())
    .bind(task.updated_at.to_rfc3339())
    .execute(executor)
    .await?;

    Ok(())
}

fn task_from_row(row: SqliteRow) -> Result<ExecutionTask, RepositoryError> {
    let action_raw = row.try_get::<String, _>("action_type")?;
    let status_raw = row.try_get::<String, _>("status")?;
    let last_error_kind = row
        .try_get::<Option<String>, _>("last_error_kind")?
        .map(|value| parse_enum("error kind", &value, ErrorKind::parse))
        .transpose()?;

    Ok(ExecutionTask {
        task_id: TaskId(row.try_get("task_id")?),
        exchange_id: ExchangeId(row.try_get("exchange_id")?),
        action_type: parse_enum("action type", &action_raw, ActionType::parse)?,
        target_reference: row.try_get("target_reference")?,
        quantity: parse_u32("quantity", row.try_get("quantity")?)?,
        required: row.try_get("required")?,
        assigned_worker_identity: row
            .try_get::<Option<String>, _>("assigned_worker_identity")?
            .map(WorkerId),
        status: parse_enum("task status", &status_raw, TaskStatus::parse)?,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        max_attempts: parse_u32("max_attempts", row.try_get("max_attempts")?)?,
        last_error: row.try_get("last_error")?,
        last_error_kind,
        available_at: parse_timestamp("available_at", row.try_get("available_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use tradeback_core::domain::contact::{Contact, ContactId};
    use tradeback_core::domain::conversation::{ConversationTurn, Intent};
    use tradeback_core::domain::exchange::{
        ActionType, Exchange, ExchangeId, ExchangeSnapshot, ExchangeState, FulfillmentStatus, Term,
    };
    use tradeback_core::domain::execution::{ErrorKind, ExecutionTask, TaskId, TaskStatus};
    use tradeback_core::domain::worker::WorkerId;

    use super::SqlExecutionTaskRepository;
    use crate::migrations;
    use crate::repositories::{
        ContactRepository, ExchangeRepository, ExecutionTaskRepository, SqlContactRepository,
        SqlExchangeRepository,
    };
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn sql_task_repo_round_trip_and_retry_update() {
        let pool = setup_pool().await;
        let exchange = seed_exchange(&pool).await;
        let repo = SqlExecutionTaskRepository::new(pool.clone());
        let first = sample_task("T-1", &exchange.exchange_id, ActionType::View);
        let second = sample_task("T-2", &exchange.exchange_id, ActionType::Endorse);

        repo.save_all(vec![first.clone(), second.clone()]).await.expect("save planned tasks");
        assert_eq!(
            repo.list_for_exchange(&exchange.exchange_id).await.expect("list"),
            vec![first.clone(), second.clone()]
        );

        let mut retried = first.clone();
        retried.status = TaskStatus::RetryScheduled;
        retried.attempt_count = 1;
        retried.assigned_worker_identity = Some(WorkerId("w-1".to_string()));
        retried.last_error = Some("throttled".to_string());
        retried.last_error_kind = Some(ErrorKind::Transient);
        retried.available_at = first.available_at + Duration::seconds(2);
        retried.updated_at = retried.available_at;
        repo.save(retried.clone()).await.expect("save retry");

        assert_eq!(repo.find_by_id(&first.task_id).await.expect("find"), Some(retried));
    }

    #[tokio::test]
    async fn attempt_count_above_budget_is_rejected() {
        let pool = setup_pool().await;
        let exchange = seed_exchange(&pool).await;
        let repo = SqlExecutionTaskRepository::new(pool.clone());
        let mut task = sample_task("T-9", &exchange.exchange_id, ActionType::Comment);
        task.attempt_count = task.max_attempts + 1;

        assert!(repo.save(task).await.is_err());
    }

    #[tokio::test]
    async fn exchange_snapshot_survives_sql_round_trip() {
        let pool = setup_pool().await;
        let exchange = seed_exchange(&pool).await;
        let exchanges = SqlExchangeRepository::new(pool.clone());
        let tasks = SqlExecutionTaskRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T11:00:00Z");

        let turn = ConversationTurn::inbound(exchange.exchange_id.clone(), "deal", Intent::Accept, now);
        exchanges.append_turn(turn.clone()).await.expect("append turn");
        let mut task = sample_task("T-5", &exchange.exchange_id, ActionType::Subscribe);
        task.required = false;
        tasks.save(task.clone()).await.expect("save task");

        let expected = ExchangeSnapshot { exchange: exchange.clone(), turns: vec![turn], tasks: vec![task] };
        let loaded = ExchangeSnapshot {
            exchange: exchanges
                .find_by_id(&exchange.exchange_id)
                .await
                .expect("find exchange")
                .expect("exchange exists"),
            turns: exchanges.list_turns(&exchange.exchange_id).await.expect("turns"),
            tasks: tasks.list_for_exchange(&exchange.exchange_id).await.expect("tasks"),
        };

        assert_eq!(loaded, expected);
        assert_eq!(loaded.digest().expect("digest"), expected.digest().expect("digest"));
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    async fn seed_exchange(pool: &DbPool) -> Exchange {
        let now = parse_ts("2026-03-01T09:00:00Z");
        let contact = Contact::new(ContactId("c-task".to_string()), "Bo", 0.5, now);
        SqlContactRepository::new(pool.clone()).save(contact.clone()).await.expect("seed contact");

        let exchange = Exchange {
            exchange_id: ExchangeId("EX-TASK".to_string()),
            contact_id: contact.contact_id,
            state: ExchangeState::Executing,
            terms_offered: vec![Term::new(ActionType::View, "their-video", 2)],
            terms_requested: vec![Term::new(ActionType::View, "our-channel", 2)],
            negotiation_round: 2,
            created_at: now,
            agreed_at: Some(now),
            completed_at: None,
            fulfillment_deadline: Some(now + Duration::hours(72)),
            our_fulfillment_status: FulfillmentStatus::InProgress,
            their_fulfillment_status: FulfillmentStatus::Pending,
            state_version: 5,
        };
        SqlExchangeRepository::new(pool.clone()).save(exchange.clone()).await.expect("seed exchange");
        exchange
    }

    fn sample_task(id: &str, exchange_id: &ExchangeId, action_type: ActionType) -> ExecutionTask {
        let now = parse_ts("2026-03-01T10:00:00Z");
        ExecutionTask {
            task_id: TaskId(id.to_string()),
            exchange_id: exchange_id.clone(),
            action_type,
            target_reference: "their-video".to_string(),
            quantity: 2,
            required: true,
            assigned_worker_identity: None,
            status: TaskStatus::Pending,
            attempt_count: 0,
            max_attempts: 3,
            last_error: None,
            last_error_kind: None,
            available_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
