use std::collections::{BTreeMap, HashMap};

use serde_json::json;
use tradeback_core::domain::exchange::ExchangeState;
use tradeback_core::domain::worker::WorkerStatus;
use tradeback_db::repositories::{SqlExchangeRepository, SqlWorkerRepository};
use tradeback_db::{ExchangeRepository, WorkerRepository};

use crate::commands::{with_database, CommandResult};

/// Persisted exchange counts per state and worker counts per status.
pub fn run() -> CommandResult {
    with_database("status", |_config, pool| async move {
        let counted: HashMap<ExchangeState, u64> =
            SqlExchangeRepository::new(pool.clone()).count_by_state().await?.into_iter().collect();
        let exchanges: BTreeMap<&'static str, u64> = ExchangeState::ALL
            .iter()
            .map(|state| (state.as_str(), counted.get(state).copied().unwrap_or(0)))
            .collect();

        let workers = SqlWorkerRepository::new(pool).list().await?;
        let worker_counts: BTreeMap<&'static str, usize> =
            [WorkerStatus::Active, WorkerStatus::CoolingDown, WorkerStatus::Retired]
                .into_iter()
                .map(|status| {
                    (status.as_str(), workers.iter().filter(|worker| worker.status == status).count())
                })
                .collect();

        let active = ExchangeState::ALL
            .iter()
            .filter(|state| !state.is_terminal())
            .map(|state| counted.get(state).copied().unwrap_or(0))
            .sum::<u64>();

        Ok(CommandResult::success_with(
            "status",
            format!("{active} active exchange(s), {} worker(s)", workers.len()),
            json!({ "exchanges": exchanges, "workers": worker_counts }),
        ))
    })
}
