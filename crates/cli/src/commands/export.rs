use serde_json::json;
use tradeback_core::domain::exchange::{ExchangeId, ExchangeSnapshot};
use tradeback_db::repositories::{SqlExchangeRepository, SqlExecutionTaskRepository};
use tradeback_db::{ExchangeRepository, ExecutionTaskRepository};

use crate::commands::{with_database, CommandFailure, CommandResult};

/// Prints the exchange with its turns and tasks, stamped with the snapshot's SHA-256 digest.
pub fn run(exchange_id: &str) -> CommandResult {
    let exchange_id = ExchangeId(exchange_id.trim().to_string());

    with_database("export", move |_config, pool| async move {
        let exchanges = SqlExchangeRepository::new(pool.clone());
        let Some(exchange) = exchanges.find_by_id(&exchange_id).await? else {
            return Err(CommandFailure::new(
                "not_found",
                format!("exchange `{}` was not found", exchange_id.0),
                9,
            ));
        };
        let turns = exchanges.list_turns(&exchange_id).await?;
        let tasks = SqlExecutionTaskRepository::new(pool).list_for_exchange(&exchange_id).await?;

        let snapshot = ExchangeSnapshot { exchange, turns, tasks };
        let digest = snapshot
            .digest()
            .map_err(|error| CommandFailure::new("serialization", error.to_string(), 10))?;

        Ok(CommandResult::success_with(
            "export",
            format!("exported exchange `{}`", exchange_id.0),
            json!({ "digest": digest, "snapshot": snapshot }),
        ))
    })
}
