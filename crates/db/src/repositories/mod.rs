use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use tradeback_core::domain::contact::{Contact, ContactId};
use tradeback_core::domain::conversation::ConversationTurn;
use tradeback_core::domain::exchange::{Exchange, ExchangeId, ExchangeState};
use tradeback_core::domain::execution::{ExecutionTask, TaskId};
use tradeback_core::domain::worker::{WorkerId, WorkerIdentity};

pub mod contact;
pub mod exchange;
pub mod execution_task;
pub mod memory;
pub mod worker;

pub use contact::SqlContactRepository;
pub use exchange::SqlExchangeRepository;
pub use execution_task::SqlExecutionTaskRepository;
pub use memory::{
    InMemoryContactRepository, InMemoryExchangeRepository, InMemoryExecutionTaskRepository,
    InMemoryWorkerRepository,
};
pub use worker::SqlWorkerRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("write conflict: {0}")]
    Conflict(String),
}

#[async_trait]
pub trait ContactRepository: Send + Sync {
    async fn find_by_id(&self, id: &ContactId) -> Result<Option<Contact>, RepositoryError>;
    async fn save(&self, contact: Contact) -> Result<(), RepositoryError>;
    async fn list(&self) -> Result<Vec<Contact>, RepositoryError>;
}

/// Exchanges and their conversation turns.
///
/// `save` rejects a write whose `state_version` is older than the stored row, and a second
/// non-terminal exchange for the same contact, with [`RepositoryError::Conflict`].
#[async_trait]
pub trait ExchangeRepository: Send + Sync {
    async fn find_by_id(&self, id: &ExchangeId) -> Result<Option<Exchange>, RepositoryError>;

    async fn find_active_for_contact(
        &self,
        contact_id: &ContactId,
    ) -> Result<Option<Exchange>, RepositoryError>;

    async fn list_by_state(&self, state: ExchangeState) -> Result<Vec<Exchange>, RepositoryError>;

    async fn count_by_state(&self) -> Result<Vec<(ExchangeState, u64)>, RepositoryError>;

    async fn save(&self, exchange: Exchange) -> Result<(), RepositoryError>;

    async fn append_turn(&self, turn: ConversationTurn) -> Result<(), RepositoryError>;

    /// Turns in arrival order.
    async fn list_turns(
        &self,
        exchange_id: &ExchangeId,
    ) -> Result<Vec<ConversationTurn>, RepositoryError>;

    /// Persists a terminal exchange together with the contact's reliability update.
    async fn commit_terminal(
        &self,
        exchange: Exchange,
        contact: Contact,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ExecutionTaskRepository: Send + Sync {
    async fn find_by_id(&self, id: &TaskId) -> Result<Option<ExecutionTask>, RepositoryError>;

    async fn list_for_exchange(
        &self,
        exchange_id: &ExchangeId,
    ) -> Result<Vec<ExecutionTask>, RepositoryError>;

    async fn save(&self, task: ExecutionTask) -> Result<(), RepositoryError>;

    /// Inserts a freshly planned task set atomically.
    async fn save_all(&self, tasks: Vec<ExecutionTask>) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn find_by_id(&self, id: &WorkerId) -> Result<Option<WorkerIdentity>, RepositoryError>;
    async fn list(&self) -> Result<Vec<WorkerIdentity>, RepositoryError>;
    async fn save(&self, worker: WorkerIdentity) -> Result<(), RepositoryError>;
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_date(column: &str, value: String) -> Result<NaiveDate, RepositoryError> {
    NaiveDate::parse_from_str(&value, "%Y-%m-%d").map_err(|error| {
        RepositoryError::Decode(format!("invalid date in `{column}`: `{value}` ({error})"))
    })
}

pub(crate) fn parse_enum<T>(
    column: &str,
    value: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, RepositoryError> {
    parse(value).ok_or_else(|| RepositoryError::Decode(format!("unknown {column} `{value}`")))
}

pub(crate) fn conflict_or_database(error: sqlx::Error, context: &str) -> RepositoryError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(format!("{context}: {db}"))
        }
        _ => RepositoryError::Database(error),
    }
}
