use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tradeback_core::config::ExecutionConfig;
use tradeback_core::domain::exchange::{Exchange, ExchangeId, ExchangeState};
use tradeback_core::domain::execution::{
    ActionRequest, ActionResponse, ExecutionTask, TaskStatus,
};
use tradeback_core::domain::worker::WorkerId;
use tradeback_core::execution_engine::{
    evaluate_completion, CompletionVerdict, RetryDecision, TaskEngine, TaskEngineConfig,
};
use tradeback_core::metrics::MetricsAggregator;
use tradeback_core::ports::{ExecutionHandoff, ExecutionReport, ExecutionReportSink, PortError};
use tradeback_core::workers::{Acquisition, AttemptOutcome, WorkerTransition};
use tradeback_db::repositories::{ExchangeRepository, ExecutionTaskRepository, RepositoryError};

use crate::driver::AutomationDriver;
use crate::pool::PoolManager;

#[derive(Debug)]
enum Command {
    Submit(Exchange),
    Cancel(ExchangeId),
}

/// Sending half of the handoff channel. Cheap to clone; never waits on execution.
#[derive(Clone, Debug)]
pub struct OrchestratorHandle {
    sender: mpsc::UnboundedSender<Command>,
}

/// Receiving half, consumed by [`Orchestrator::run`].
#[derive(Debug)]
pub struct OrchestratorInbox {
    receiver: mpsc::UnboundedReceiver<Command>,
}

impl OrchestratorHandle {
    pub fn new() -> (Self, OrchestratorInbox) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, OrchestratorInbox { receiver })
    }
}

#[async_trait]
impl ExecutionHandoff for OrchestratorHandle {
    async fn submit(&self, exchange: Exchange) -> Result<(), PortError> {
        self.sender
            .send(Command::Submit(exchange))
            .map_err(|_| PortError::Handoff("orchestrator is not running".to_string()))
    }

    async fn cancel(&self, exchange_id: &ExchangeId) -> Result<(), PortError> {
        self.sender
            .send(Command::Cancel(exchange_id.clone()))
            .map_err(|_| PortError::Handoff("orchestrator is not running".to_string()))
    }
}

pub struct OrchestratorDeps {
    pub tasks: Arc<dyn ExecutionTaskRepository>,
    pub exchanges: Arc<dyn ExchangeRepository>,
    pub pool: Arc<PoolManager>,
    pub driver: Arc<dyn AutomationDriver>,
    pub reports: Arc<dyn ExecutionReportSink>,
    pub metrics: Arc<MetricsAggregator>,
}

/// Runs the task set of every exchange handed off for execution.
///
/// Tasks of one exchange run concurrently after a staggered start; attempts across all
/// exchanges share one semaphore. The exchange outcome is evaluated over the whole task set
/// after every task settles and reported once.
pub struct Orchestrator {
    engine: TaskEngine,
    config: ExecutionConfig,
    deps: OrchestratorDeps,
    permits: Arc<Semaphore>,
    running: DashMap<ExchangeId, CancellationToken>,
}

enum TaskEnd {
    Settled(ExecutionTask),
    Cancelled(ExecutionTask),
}

impl Orchestrator {
    pub fn new(config: &ExecutionConfig, deps: OrchestratorDeps) -> Arc<Self> {
        Arc::new(Self {
            engine: TaskEngine::new(TaskEngineConfig::from(config)),
            config: config.clone(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            running: DashMap::new(),
            deps,
        })
    }

    pub fn spawn(self: &Arc<Self>, inbox: OrchestratorInbox) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(inbox))
    }

    /// Consumes handoff commands until every handle is dropped.
    ///
    /// A submitted exchange is registered before its task is spawned, so a cancel queued
    /// right behind the submit always finds it.
    pub async fn run(self: Arc<Self>, mut inbox: OrchestratorInbox) {
        while let Some(command) = inbox.receiver.recv().await {
            match command {
                Command::Submit(exchange) => self.start(exchange),
                Command::Cancel(exchange_id) => self.cancel(&exchange_id).await,
            }
        }
        debug!("orchestrator inbox closed");
    }

    pub fn is_running(&self, exchange_id: &ExchangeId) -> bool {
        self.running.contains_key(exchange_id)
    }

    fn start(self: &Arc<Self>, exchange: Exchange) {
        let token = match self.running.entry(exchange.exchange_id.clone()) {
            Entry::Occupied(_) => {
                debug!(
                    exchange_id = %exchange.exchange_id,
                    "exchange already executing; duplicate handoff ignored"
                );
                return;
            }
            Entry::Vacant(slot) => slot.insert(CancellationToken::new()).clone(),
        };
        tokio::spawn(self.clone().execute(exchange, token));
    }

    /// Plans (or reloads) the exchange's tasks and drives them to completion.
    async fn execute(self: Arc<Self>, exchange: Exchange, token: CancellationToken) {
        let exchange_id = exchange.exchange_id.clone();

        if token.is_cancelled() || self.left_execution(&exchange_id).await {
            info!(
                event_name = "executor.exchange.skipped",
                exchange_id = %exchange_id,
                correlation_id = %exchange_id,
                "exchange cancelled before its tasks started"
            );
            self.running.remove(&exchange_id);
            self.cancel_stored(&exchange_id).await;
            return;
        }

        match self.load_or_plan(&exchange).await {
            Ok(tasks) => self.clone().drive(exchange_id.clone(), tasks, token).await,
            Err(error) => self.persistence_failed(&exchange_id, "plan execution tasks", &error),
        }

        self.running.remove(&exchange_id);
    }

    /// True when the stored exchange has already moved past `EXECUTING`.
    async fn left_execution(&self, exchange_id: &ExchangeId) -> bool {
        match self.deps.exchanges.find_by_id(exchange_id).await {
            Ok(Some(stored)) => stored.state != ExchangeState::Executing,
            Ok(None) => false,
            Err(error) => {
                self.persistence_failed(exchange_id, "reload exchange before planning", &error);
                false
            }
        }
    }

    /// Stops an exchange's execution. Not-yet-started tasks are failed as cancelled and
    /// in-flight attempts are aborted; succeeded tasks are kept.
    pub async fn cancel(&self, exchange_id: &ExchangeId) {
        if let Some(token) = self.running.get(exchange_id) {
            info!(
                event_name = "executor.exchange.cancel_requested",
                exchange_id = %exchange_id,
                correlation_id = %exchange_id,
                "cancelling in-flight execution"
            );
            token.cancel();
            return;
        }

        self.cancel_stored(exchange_id).await;
    }

    async fn cancel_stored(&self, exchange_id: &ExchangeId) {
        let tasks = match self.deps.tasks.list_for_exchange(exchange_id).await {
            Ok(tasks) => tasks,
            Err(error) => {
                self.persistence_failed(exchange_id, "load tasks for cancel", &error);
                return;
            }
        };
        let now = Utc::now();
        for mut task in tasks {
            if self.engine.cancel(&mut task, now) {
                self.save_task(&task).await;
            }
        }
    }

    /// Restarts execution for every exchange persisted as `EXECUTING`.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize, RepositoryError> {
        let executing = self.deps.exchanges.list_by_state(ExchangeState::Executing).await?;
        let now = Utc::now();
        let mut resumed = 0;

        for exchange in executing {
            for mut task in self.deps.tasks.list_for_exchange(&exchange.exchange_id).await? {
                if self.engine.recover_interrupted(&mut task, now) {
                    self.deps.tasks.save(task).await?;
                }
            }
            info!(
                event_name = "executor.exchange.resumed",
                exchange_id = %exchange.exchange_id,
                correlation_id = %exchange.exchange_id,
                "resuming execution after restart"
            );
            self.start(exchange);
            resumed += 1;
        }

        Ok(resumed)
    }

    async fn load_or_plan(&self, exchange: &Exchange) -> Result<Vec<ExecutionTask>, RepositoryError> {
        let existing = self.deps.tasks.list_for_exchange(&exchange.exchange_id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let planned = self.engine.plan_tasks(exchange, Utc::now());
        self.deps.tasks.save_all(planned.clone()).await?;
        info!(
            event_name = "executor.exchange.tasks_planned",
            exchange_id = %exchange.exchange_id,
            correlation_id = %exchange.exchange_id,
            task_count = planned.len(),
            "execution tasks planned"
        );
        Ok(planned)
    }

    async fn drive(self: Arc<Self>, exchange_id: ExchangeId, tasks: Vec<ExecutionTask>, token: CancellationToken) {
        let pending: Vec<ExecutionTask> =
            tasks.iter().filter(|task| !task.status.is_terminal()).cloned().collect();
        let mut current: HashMap<String, ExecutionTask> =
            tasks.into_iter().map(|task| (task.task_id.0.clone(), task)).collect();

        let delays = stagger_delays(pending.len(), self.config.jitter_min_ms, self.config.jitter_max_ms);
        let mut in_flight = JoinSet::new();
        for (task, delay) in pending.into_iter().zip(delays) {
            in_flight.spawn(self.clone().run_task(task, token.clone(), delay));
        }

        let mut reported = false;
        while let Some(joined) = in_flight.join_next().await {
            let task = match joined {
                Ok(TaskEnd::Settled(task)) | Ok(TaskEnd::Cancelled(task)) => task,
                Err(join_error) => {
                    error!(exchange_id = %exchange_id, error = %join_error, "task runner panicked");
                    continue;
                }
            };
            current.insert(task.task_id.0.clone(), task);

            if reported || token.is_cancelled() {
                continue;
            }
            let snapshot: Vec<ExecutionTask> = current.values().cloned().collect();
            reported = self.report_if_settled(&exchange_id, &snapshot, &token).await;
        }

        if !reported && !token.is_cancelled() {
            let snapshot: Vec<ExecutionTask> = current.values().cloned().collect();
            self.report_if_settled(&exchange_id, &snapshot, &token).await;
        }
    }

    async fn report_if_settled(
        &self,
        exchange_id: &ExchangeId,
        tasks: &[ExecutionTask],
        token: &CancellationToken,
    ) -> bool {
        match evaluate_completion(tasks) {
            CompletionVerdict::InProgress => false,
            CompletionVerdict::Fulfilled => {
                info!(
                    event_name = "executor.exchange.fulfilled",
                    exchange_id = %exchange_id,
                    correlation_id = %exchange_id,
                    "all required tasks succeeded"
                );
                self.deps
                    .reports
                    .report(ExecutionReport::OurFulfillmentComplete { exchange_id: exchange_id.clone() })
                    .await;
                true
            }
            CompletionVerdict::RequiredFailed => {
                // Cancel first so remaining tasks stop before the runtime hears about it.
                token.cancel();
                let failed = tasks
                    .iter()
                    .filter(|task| task.required && task.status == TaskStatus::Failed)
                    .min_by_key(|task| task.updated_at);
                let (task_id, detail) = match failed {
                    Some(task) => (
                        task.task_id.clone(),
                        task.last_error.clone().unwrap_or_else(|| "task failed".to_string()),
                    ),
                    None => return false,
                };
                warn!(
                    event_name = "executor.exchange.required_task_failed",
                    exchange_id = %exchange_id,
                    correlation_id = %exchange_id,
                    task_id = %task_id,
                    detail = %detail,
                    "required task failed; cancelling remaining tasks"
                );
                self.deps
                    .reports
                    .report(ExecutionReport::RequiredTaskFailed {
                        exchange_id: exchange_id.clone(),
                        task_id,
                        detail,
                    })
                    .await;
                true
            }
        }
    }

    async fn run_task(self: Arc<Self>, mut task: ExecutionTask, token: CancellationToken, initial_delay: Duration) -> TaskEnd {
        if !self.pause(initial_delay, &token).await {
            return self.cancel_task(task).await;
        }

        loop {
            if token.is_cancelled() {
                return self.cancel_task(task).await;
            }

            let wait = (task.available_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if !self.pause(wait, &token).await {
                return self.cancel_task(task).await;
            }

            let permit = tokio::select! {
                _ = token.cancelled() => return self.cancel_task(task).await,
                permit = self.permits.clone().acquire_owned() => permit,
            };
            let Ok(_permit) = permit else {
                return self.cancel_task(task).await;
            };

            let now = Utc::now();
            let worker_id = match self.deps.pool.acquire(task.action_type, now).await {
                Ok(Acquisition::Assigned(worker_id)) => worker_id,
                Ok(Acquisition::Unavailable) => {
                    debug!(
                        exchange_id = %task.exchange_id,
                        task_id = %task.task_id,
                        "no worker available; requeueing task"
                    );
                    self.requeue(&mut task);
                    self.save_task(&task).await;
                    continue;
                }
                Err(error) => {
                    self.persistence_failed(&task.exchange_id, "acquire worker", &error);
                    self.requeue(&mut task);
                    continue;
                }
            };

            let is_retry = task.attempt_count > 0;
            if let Err(error) = self.engine.start_attempt(&mut task, worker_id.clone(), now) {
                warn!(task_id = %task.task_id, error = %error, "task cannot start another attempt");
                self.release_worker(&worker_id, AttemptOutcome::Abandoned).await;
                self.engine.cancel(&mut task, now);
                self.save_task(&task).await;
                return TaskEnd::Settled(task);
            }
            self.save_task(&task).await;
            self.deps.metrics.record_task_attempt(is_retry);

            info!(
                event_name = "executor.task.attempt_started",
                exchange_id = %task.exchange_id,
                correlation_id = %task.exchange_id,
                task_id = %task.task_id,
                worker_id = %worker_id,
                attempt = task.attempt_count,
                "task attempt started"
            );

            let request = ActionRequest {
                task_id: task.task_id.clone(),
                action_type: task.action_type,
                target_reference: task.target_reference.clone(),
                quantity: task.quantity,
                worker_id: worker_id.clone(),
            };
            let timeout = Duration::from_millis(self.config.task_timeout_ms);
            let response = tokio::select! {
                _ = token.cancelled() => None,
                result = tokio::time::timeout(timeout, self.deps.driver.execute(&request)) => Some(
                    result.unwrap_or_else(|_| {
                        ActionResponse::transient(format!(
                            "attempt timed out after {}ms",
                            self.config.task_timeout_ms
                        ))
                    }),
                ),
            };

            let Some(response) = response else {
                self.release_worker(&worker_id, AttemptOutcome::Abandoned).await;
                return self.cancel_task(task).await;
            };

            let now = Utc::now();
            match response.error_kind() {
                None => {
                    self.release_worker(&worker_id, AttemptOutcome::Succeeded).await;
                    if let Err(error) = self.engine.complete(&mut task, now) {
                        warn!(task_id = %task.task_id, error = %error, "could not complete task");
                    }
                    self.save_task(&task).await;
                    info!(
                        event_name = "executor.task.succeeded",
                        exchange_id = %task.exchange_id,
                        correlation_id = %task.exchange_id,
                        task_id = %task.task_id,
                        "task succeeded"
                    );
                    return TaskEnd::Settled(task);
                }
                Some(kind) => {
                    let transition =
                        self.release_worker(&worker_id, AttemptOutcome::Failed(kind)).await;
                    let decision = match self.engine.fail(&mut task, kind, response.detail.clone(), now) {
                        Ok(decision) => decision,
                        Err(error) => {
                            warn!(task_id = %task.task_id, error = %error, "could not fail task");
                            RetryDecision::Fail
                        }
                    };
                    if matches!(
                        transition,
                        Some(WorkerTransition::CooledDown { .. } | WorkerTransition::Retired)
                    ) {
                        self.engine.release_assignment(&mut task, now);
                    }
                    self.save_task(&task).await;

                    warn!(
                        event_name = "executor.task.attempt_failed",
                        exchange_id = %task.exchange_id,
                        correlation_id = %task.exchange_id,
                        task_id = %task.task_id,
                        error_kind = kind.as_str(),
                        detail = %response.detail,
                        decision = ?decision,
                        "task attempt failed"
                    );
                    if decision == RetryDecision::Fail {
                        return TaskEnd::Settled(task);
                    }
                }
            }
        }
    }

    async fn pause(&self, delay: Duration, token: &CancellationToken) -> bool {
        if delay.is_zero() {
            return !token.is_cancelled();
        }
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn requeue(&self, task: &mut ExecutionTask) {
        let delay = chrono::Duration::milliseconds(
            i64::try_from(self.config.requeue_delay_ms).unwrap_or(i64::MAX / 1_000),
        );
        let now = Utc::now();
        task.available_at = now + delay;
        task.updated_at = now;
    }

    async fn cancel_task(&self, mut task: ExecutionTask) -> TaskEnd {
        if self.engine.cancel(&mut task, Utc::now()) {
            self.save_task(&task).await;
            debug!(
                exchange_id = %task.exchange_id,
                task_id = %task.task_id,
                "task cancelled"
            );
        }
        TaskEnd::Cancelled(task)
    }

    async fn release_worker(
        &self,
        worker_id: &WorkerId,
        outcome: AttemptOutcome,
    ) -> Option<WorkerTransition> {
        match self.deps.pool.release(worker_id, outcome, Utc::now()).await {
            Ok(transition) => Some(transition),
            Err(error) => {
                error!(worker_id = %worker_id, error = %error, "failed to release worker");
                self.deps.metrics.record_persistence_failure(error.to_string(), Utc::now());
                None
            }
        }
    }

    async fn save_task(&self, task: &ExecutionTask) {
        if let Err(error) = self.deps.tasks.save(task.clone()).await {
            self.persistence_failed(&task.exchange_id, "save task", &error);
        }
    }

    fn persistence_failed(&self, exchange_id: &ExchangeId, operation: &str, error: &RepositoryError) {
        error!(
            event_name = "executor.persistence_failed",
            exchange_id = %exchange_id,
            correlation_id = %exchange_id,
            operation,
            error = %error,
            "execution state could not be persisted"
        );
        self.deps
            .metrics
            .record_persistence_failure(format!("{operation}: {error}"), Utc::now());
    }
}

/// Cumulative start offsets so tasks of one exchange never start together.
fn stagger_delays(count: usize, min_ms: u64, max_ms: u64) -> Vec<Duration> {
    let (low, high) = if min_ms <= max_ms { (min_ms, max_ms) } else { (max_ms, min_ms) };
    let mut rng = rand::thread_rng();
    let mut offset = 0u64;
    (0..count)
        .map(|_| {
            offset = offset.saturating_add(rng.gen_range(low..=high));
            Duration::from_millis(offset)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::stagger_delays;

    #[test]
    fn stagger_offsets_grow_within_jitter_bounds() {
        let delays = stagger_delays(4, 10, 20);
        assert_eq!(delays.len(), 4);
        for pair in delays.windows(2) {
            let step = pair[1] - pair[0];
            assert!(step.as_millis() >= 10 && step.as_millis() <= 20);
        }
        assert!(delays[0].as_millis() >= 10);
    }

    #[test]
    fn zero_jitter_starts_everything_immediately() {
        assert!(stagger_delays(3, 0, 0).iter().all(|delay| delay.is_zero()));
    }
}
