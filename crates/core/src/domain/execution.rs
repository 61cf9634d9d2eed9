use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::exchange::{ActionType, ExchangeId};
use crate::domain::worker::WorkerId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RetryScheduled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RetryScheduled => "retry_scheduled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "retry_scheduled" => Some(Self::RetryScheduled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "transient" => Some(Self::Transient),
            "permanent" => Some(Self::Permanent),
            _ => None,
        }
    }
}

/// One unit of automated work fulfilling a single offered term.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub task_id: TaskId,
    pub exchange_id: ExchangeId,
    pub action_type: ActionType,
    pub target_reference: String,
    pub quantity: u32,
    pub required: bool,
    pub assigned_worker_identity: Option<WorkerId>,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status reported by the automation driver for one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    TransientError,
    PermanentError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub task_id: TaskId,
    pub action_type: ActionType,
    pub target_reference: String,
    pub quantity: u32,
    pub worker_id: WorkerId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub status: ActionStatus,
    pub detail: String,
}

impl ActionResponse {
    pub fn success(detail: impl Into<String>) -> Self {
        Self { status: ActionStatus::Success, detail: detail.into() }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self { status: ActionStatus::TransientError, detail: detail.into() }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self { status: ActionStatus::PermanentError, detail: detail.into() }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.status {
            ActionStatus::Success => None,
            ActionStatus::TransientError => Some(ErrorKind::Transient),
            ActionStatus::PermanentError => Some(ErrorKind::Permanent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ActionResponse, ErrorKind, TaskStatus};

    #[test]
    fn task_status_round_trips_from_storage_encoding() {
        let cases = [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::RetryScheduled,
        ];

        for status in cases {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn response_status_maps_to_error_kind() {
        assert_eq!(ActionResponse::success("ok").error_kind(), None);
        assert_eq!(ActionResponse::transient("timeout").error_kind(), Some(ErrorKind::Transient));
        assert_eq!(ActionResponse::permanent("gone").error_kind(), Some(ErrorKind::Permanent));
    }
}
