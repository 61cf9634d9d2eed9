use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tradeback_agent::ConversationRuntime;

/// Periodically fails executing exchanges whose fulfillment deadline has passed.
pub fn spawn_deadline_sweeper(
    runtime: Arc<ConversationRuntime>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("deadline sweeper stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            // Errors are logged and alerted by the runtime; the next tick retries.
            if let Ok(failed) = runtime.sweep_deadlines(Utc::now()).await {
                if failed > 0 {
                    info!(
                        event_name = "system.deadline_sweep.failed_exchanges",
                        failed,
                        "fulfillment deadlines elapsed"
                    );
                }
            }
        }
    })
}
