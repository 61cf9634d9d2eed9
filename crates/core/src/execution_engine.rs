//! Deterministic task lifecycle for exchange fulfillment.
//!
//! Every transition here is a pure function of the task record, the attempt
//! outcome and the configured retry budget. Scheduling, timeouts and driver
//! I/O live in the executor crate.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::domain::exchange::Exchange;
use crate::domain::execution::{ErrorKind, ExecutionTask, TaskId, TaskStatus};
use crate::domain::worker::WorkerId;

pub const CANCELLED_ERROR: &str = "cancelled";
pub const INTERRUPTED_ERROR: &str = "interrupted";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskEngineConfig {
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

impl From<&ExecutionConfig> for TaskEngineConfig {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            retry_base_delay_ms: config.retry_base_delay_ms,
            retry_max_delay_ms: config.retry_max_delay_ms,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("invalid task transition for {task_id}: {from:?} -> {to:?}: {reason}")]
    InvalidTransition { task_id: TaskId, from: TaskStatus, to: TaskStatus, reason: String },
    #[error("task {task_id} exhausted its attempt budget of {max_attempts}")]
    AttemptBudgetExhausted { task_id: TaskId, max_attempts: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay_ms: u64 },
    Fail,
}

/// Aggregate view of an exchange's task set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionVerdict {
    InProgress,
    Fulfilled,
    RequiredFailed,
}

/// `base * 2^(attempt-1)`, capped at `max`.
pub fn backoff_delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(63);
    base_ms.saturating_mul(1u64 << exponent).min(max_ms)
}

pub fn retry_decision(
    kind: ErrorKind,
    attempt_count: u32,
    max_attempts: u32,
    config: &TaskEngineConfig,
) -> RetryDecision {
    match kind {
        ErrorKind::Permanent => RetryDecision::Fail,
        ErrorKind::Transient if attempt_count >= max_attempts => RetryDecision::Fail,
        ErrorKind::Transient => RetryDecision::Retry {
            delay_ms: backoff_delay_ms(
                attempt_count,
                config.retry_base_delay_ms,
                config.retry_max_delay_ms,
            ),
        },
    }
}

/// Completion is judged over the whole set so task ordering never matters.
pub fn evaluate_completion(tasks: &[ExecutionTask]) -> CompletionVerdict {
    if tasks.iter().any(|task| task.required && task.status == TaskStatus::Failed) {
        return CompletionVerdict::RequiredFailed;
    }
    if tasks.iter().all(|task| task.status.is_terminal()) {
        return CompletionVerdict::Fulfilled;
    }
    CompletionVerdict::InProgress
}

#[derive(Clone, Debug, Default)]
pub struct TaskEngine {
    config: TaskEngineConfig,
}

impl TaskEngine {
    pub fn new(config: TaskEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TaskEngineConfig {
        &self.config
    }

    /// One task per `(action_type, target_reference)` pair of the offered terms.
    /// Duplicate pairs are merged by summing quantity; the merged task is required
    /// if any contributing term is.
    pub fn plan_tasks(&self, exchange: &Exchange, now: DateTime<Utc>) -> Vec<ExecutionTask> {
        let mut tasks: Vec<ExecutionTask> = Vec::new();

        for term in &exchange.terms_offered {
            if let Some(existing) = tasks.iter_mut().find(|task| {
                task.action_type == term.action_type
                    && task.target_reference == term.target_reference
            }) {
                existing.quantity = existing.quantity.saturating_add(term.quantity);
                existing.required |= term.required;
                continue;
            }

            tasks.push(ExecutionTask {
                task_id: TaskId(Uuid::new_v4().to_string()),
                exchange_id: exchange.exchange_id.clone(),
                action_type: term.action_type,
                target_reference: term.target_reference.clone(),
                quantity: term.quantity,
                required: term.required,
                assigned_worker_identity: None,
                status: TaskStatus::Pending,
                attempt_count: 0,
                max_attempts: self.config.max_attempts,
                last_error: None,
                last_error_kind: None,
                available_at: now,
                created_at: now,
                updated_at: now,
            });
        }

        tasks
    }

    /// Pending | RetryScheduled -> Running. Consumes one attempt.
    pub fn start_attempt(
        &self,
        task: &mut ExecutionTask,
        worker_id: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), ExecutionError> {
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::RetryScheduled) {
            return Err(invalid(task, TaskStatus::Running, "task is not waiting to run"));
        }
        if task.attempt_count >= task.max_attempts {
            return Err(ExecutionError::AttemptBudgetExhausted {
                task_id: task.task_id.clone(),
                max_attempts: task.max_attempts,
            });
        }

        task.status = TaskStatus::Running;
        task.attempt_count += 1;
        task.assigned_worker_identity = Some(worker_id);
        task.updated_at = now;
        Ok(())
    }

    pub fn complete(&self, task: &mut ExecutionTask, now: DateTime<Utc>) -> Result<(), ExecutionError> {
        if task.status != TaskStatus::Running {
            return Err(invalid(task, TaskStatus::Succeeded, "only running tasks can succeed"));
        }
        task.status = TaskStatus::Succeeded;
        task.updated_at = now;
        Ok(())
    }

    /// Running -> RetryScheduled or Failed, per [`retry_decision`].
    pub fn fail(
        &self,
        task: &mut ExecutionTask,
        kind: ErrorKind,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, ExecutionError> {
        if task.status != TaskStatus::Running {
            return Err(invalid(task, TaskStatus::Failed, "only running tasks can fail"));
        }

        let decision = retry_decision(kind, task.attempt_count, task.max_attempts, &self.config);
        task.last_error = Some(detail.into());
        task.last_error_kind = Some(kind);
        task.updated_at = now;

        match decision {
            RetryDecision::Retry { delay_ms } => {
                task.status = TaskStatus::RetryScheduled;
                task.available_at = now + Duration::milliseconds(clamp_millis(delay_ms));
            }
            RetryDecision::Fail => task.status = TaskStatus::Failed,
        }
        Ok(decision)
    }

    /// Marks any non-terminal task failed as cancelled. Succeeded work is kept.
    pub fn cancel(&self, task: &mut ExecutionTask, now: DateTime<Utc>) -> bool {
        if task.status.is_terminal() {
            return false;
        }
        task.status = TaskStatus::Failed;
        task.last_error = Some(CANCELLED_ERROR.to_string());
        task.last_error_kind = Some(ErrorKind::Permanent);
        task.updated_at = now;
        true
    }

    /// Drops the worker assignment of a task waiting for retry so another worker picks it up.
    pub fn release_assignment(&self, task: &mut ExecutionTask, now: DateTime<Utc>) -> bool {
        if task.status != TaskStatus::RetryScheduled || task.assigned_worker_identity.is_none() {
            return false;
        }
        task.assigned_worker_identity = None;
        task.updated_at = now;
        true
    }

    /// A task found `Running` after a restart lost its attempt; the attempt stays consumed.
    pub fn recover_interrupted(&self, task: &mut ExecutionTask, now: DateTime<Utc>) -> bool {
        if task.status != TaskStatus::Running {
            return false;
        }
        task.assigned_worker_identity = None;
        task.last_error = Some(INTERRUPTED_ERROR.to_string());
        task.last_error_kind = Some(ErrorKind::Transient);
        task.updated_at = now;
        task.available_at = now;
        task.status = if task.attempt_count >= task.max_attempts {
            TaskStatus::Failed
        } else {
            TaskStatus::RetryScheduled
        };
        true
    }
}

fn invalid(task: &ExecutionTask, to: TaskStatus, reason: &str) -> ExecutionError {
    ExecutionError::InvalidTransition {
        task_id: task.task_id.clone(),
        from: task.status,
        to,
        reason: reason.to_string(),
    }
}

fn clamp_millis(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
