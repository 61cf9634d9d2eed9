use std::collections::BTreeSet;

use sqlx::{sqlite::SqliteRow, Row};

use tradeback_core::domain::exchange::ActionType;
use tradeback_core::domain::worker::{WorkerId, WorkerIdentity, WorkerStatus};

use super::{
    parse_date, parse_enum, parse_optional_timestamp, parse_u32, RepositoryError,
    WorkerRepository,
};
use crate::DbPool;

const WORKER_COLUMNS: &str = "worker_id,
    daily_action_count,
    daily_action_cap,
    counter_day,
    last_used_at,
    ban_signal_score,
    status,
    cooldown_until,
    cooldown_count,
    supported_actions_json";

pub struct SqlWorkerRepository {
    pool: DbPool,
}

impl SqlWorkerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl WorkerRepository for SqlWorkerRepository {
    async fn find_by_id(&self, id: &WorkerId) -> Result<Option<WorkerIdentity>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKER_COLUMNS} FROM worker_identity WHERE worker_id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(worker_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<WorkerIdentity>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKER_COLUMNS} FROM worker_identity ORDER BY worker_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(worker_from_row).collect()
    }

    async fn save(&self, worker: WorkerIdentity) -> Result<(), RepositoryError> {
        let actions: Vec<&str> =
            worker.supported_actions.iter().map(|action| action.as_str()).collect();
        let actions_json = serde_json::to_string(&actions)
            .map_err(|error| RepositoryError::Decode(format!("cannot encode actions: {error}")))?;

        sqlx::query(
            "INSERT INTO worker_identity (
                worker_id,
                daily_action_count,
                daily_action_cap,
                counter_day,
                last_used_at,
                ban_signal_score,
                status,
                cooldown_until,
                cooldown_count,
                supported_actions_json
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(worker_id) DO UPDATE SET
                daily_action_count = excluded.daily_action_count,
                daily_action_cap = excluded.daily_action_cap,
                counter_day = excluded.counter_day,
                last_used_at = excluded.last_used_at,
                ban_signal_score = excluded.ban_signal_score,
                status = excluded.status,
                cooldown_until = excluded.cooldown_until,
                cooldown_count = excluded.cooldown_count,
                supported_actions_json = excluded.supported_actions_json",
        )
        .bind(&worker.worker_id.0)
        .bind(i64::from(worker.daily_action_count))
        .bind(i64::from(worker.daily_action_cap))
        .bind(worker.counter_day.format("%Y-%m-%d").to_string())
        .bind(worker.last_used_at.map(|value| value.to_rfc3339()))
        .bind(worker.ban_signal_score)
        .bind(worker.status.as_str())
        .bind(worker.cooldown_until.map(|value| value.to_rfc3339()))
        .bind(i64::from(worker.cooldown_count))
        .bind(actions_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn worker_from_row(row: SqliteRow) -> Result<WorkerIdentity, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let actions_raw = row.try_get::<String, _>("supported_actions_json")?;
    let action_names: Vec<String> = serde_json::from_str(&actions_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid supported_actions_json `{actions_raw}`: {error}"))
    })?;
    let supported_actions = action_names
        .iter()
        .map(|name| parse_enum("action type", name, ActionType::parse))
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(WorkerIdentity {
        worker_id: WorkerId(row.try_get("worker_id")?),
        daily_action_count: parse_u32("daily_action_count", row.try_get("daily_action_count")?)?,
        daily_action_cap: parse_u32("daily_action_cap", row.try_get("daily_action_cap")?)?,
        counter_day: parse_date("counter_day", row.try_get("counter_day")?)?,
        last_used_at: parse_optional_timestamp("last_used_at", row.try_get("last_used_at")?)?,
        ban_signal_score: row.try_get("ban_signal_score")?,
        status: parse_enum("worker status", &status_raw, WorkerStatus::parse)?,
        cooldown_until: parse_optional_timestamp("cooldown_until", row.try_get("cooldown_until")?)?,
        cooldown_count: parse_u32("cooldown_count", row.try_get("cooldown_count")?)?,
        supported_actions,
    })
}
