use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tradeback_core::domain::exchange::ActionType;
use tradeback_core::domain::worker::{WorkerId, WorkerIdentity};
use tradeback_db::repositories::SqlWorkerRepository;
use tradeback_db::WorkerRepository;

use crate::commands::{with_database, CommandFailure, CommandResult};

#[derive(Debug, Serialize)]
struct WorkerRow {
    worker_id: String,
    status: &'static str,
    daily_action_count: u32,
    daily_action_cap: u32,
    ban_signal_score: f64,
    cooldown_count: u32,
    supported_actions: Vec<&'static str>,
}

impl From<&WorkerIdentity> for WorkerRow {
    fn from(worker: &WorkerIdentity) -> Self {
        Self {
            worker_id: worker.worker_id.0.clone(),
            status: worker.status.as_str(),
            daily_action_count: worker.daily_action_count,
            daily_action_cap: worker.daily_action_cap,
            ban_signal_score: worker.ban_signal_score,
            cooldown_count: worker.cooldown_count,
            supported_actions: worker.supported_actions.iter().map(ActionType::as_str).collect(),
        }
    }
}

/// Registers a worker identity. Re-adding an existing id is refused so its counters survive.
pub fn add(worker_id: &str, daily_cap: Option<u32>, actions: &[String]) -> CommandResult {
    let worker_id = worker_id.trim().to_string();
    let parsed: Result<Vec<ActionType>, String> = actions
        .iter()
        .map(|raw| ActionType::parse(raw).ok_or_else(|| format!("unknown action type `{raw}`")))
        .collect();

    with_database("workers.add", move |config, pool| async move {
        if worker_id.is_empty() {
            return Err(CommandFailure::new("invalid_input", "worker id must not be empty", 7));
        }
        let supported = parsed.map_err(|message| CommandFailure::new("invalid_input", message, 7))?;

        let repository = SqlWorkerRepository::new(pool);
        let id = WorkerId(worker_id.clone());
        if repository.find_by_id(&id).await?.is_some() {
            return Err(CommandFailure::new(
                "already_exists",
                format!("worker `{worker_id}` is already registered"),
                8,
            ));
        }

        let cap = daily_cap.unwrap_or(config.workers.default_daily_cap);
        let worker = WorkerIdentity::new(id, cap, Utc::now()).with_supported_actions(supported);
        repository.save(worker.clone()).await?;

        Ok(CommandResult::success_with(
            "workers.add",
            format!("registered worker `{worker_id}` with daily cap {cap}"),
            json!(WorkerRow::from(&worker)),
        ))
    })
}

pub fn list() -> CommandResult {
    with_database("workers.list", |_config, pool| async move {
        let workers = SqlWorkerRepository::new(pool).list().await?;
        let rows: Vec<WorkerRow> = workers.iter().map(WorkerRow::from).collect();
        Ok(CommandResult::success_with(
            "workers.list",
            format!("{} worker(s) registered", rows.len()),
            json!(rows),
        ))
    })
}
