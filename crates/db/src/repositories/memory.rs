use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use tradeback_core::domain::contact::{Contact, ContactId};
use tradeback_core::domain::conversation::ConversationTurn;
use tradeback_core::domain::exchange::{Exchange, ExchangeId, ExchangeState};
use tradeback_core::domain::execution::{ExecutionTask, TaskId};
use tradeback_core::domain::worker::{WorkerId, WorkerIdentity};

use super::{
    ContactRepository, ExchangeRepository, ExecutionTaskRepository, RepositoryError,
    WorkerRepository,
};

#[derive(Default)]
pub struct InMemoryContactRepository {
    contacts: RwLock<HashMap<String, Contact>>,
}

#[async_trait::async_trait]
impl ContactRepository for InMemoryContactRepository {
    async fn find_by_id(&self, id: &ContactId) -> Result<Option<Contact>, RepositoryError> {
        let contacts = self.contacts.read().await;
        Ok(contacts.get(&id.0).cloned())
    }

    async fn save(&self, contact: Contact) -> Result<(), RepositoryError> {
        let mut contacts = self.contacts.write().await;
        contacts.insert(contact.contact_id.0.clone(), contact);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Contact>, RepositoryError> {
        let contacts = self.contacts.read().await;
        let mut listed: Vec<Contact> = contacts.values().cloned().collect();
        listed.sort_by(|a, b| {
            b.last_seen.cmp(&a.last_seen).then_with(|| a.contact_id.cmp(&b.contact_id))
        });
        Ok(listed)
    }
}

/// Mirrors the SQL store's version and single-active-exchange checks.
///
/// Terminal commits write through to the shared contact store so tests can observe the
/// reliability update the same way they would with SQLite.
#[derive(Default)]
pub struct InMemoryExchangeRepository {
    exchanges: RwLock<HashMap<String, Exchange>>,
    turns: RwLock<HashMap<String, Vec<ConversationTurn>>>,
    contacts: Arc<InMemoryContactRepository>,
}

impl InMemoryExchangeRepository {
    pub fn with_contacts(contacts: Arc<InMemoryContactRepository>) -> Self {
        Self { contacts, ..Self::default() }
    }

    fn check_write(
        exchanges: &HashMap<String, Exchange>,
        exchange: &Exchange,
    ) -> Result<(), RepositoryError> {
        if let Some(stored) = exchanges.get(&exchange.exchange_id.0) {
            if stored.state_version > exchange.state_version {
                return Err(RepositoryError::Conflict(format!(
                    "exchange `{}` was written with a newer state_version than {}",
                    exchange.exchange_id, exchange.state_version
                )));
            }
        }

        if !exchange.state.is_terminal() {
            let duplicate = exchanges.values().any(|other| {
                other.contact_id == exchange.contact_id
                    && other.exchange_id != exchange.exchange_id
                    && !other.state.is_terminal()
            });
            if duplicate {
                return Err(RepositoryError::Conflict(format!(
                    "contact `{}` already has an active exchange",
                    exchange.contact_id
                )));
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl ExchangeRepository for InMemoryExchangeRepository {
    async fn find_by_id(&self, id: &ExchangeId) -> Result<Option<Exchange>, RepositoryError> {
        let exchanges = self.exchanges.read().await;
        Ok(exchanges.get(&id.0).cloned())
    }

    async fn find_active_for_contact(
        &self,
        contact_id: &ContactId,
    ) -> Result<Option<Exchange>, RepositoryError> {
        let exchanges = self.exchanges.read().await;
        Ok(exchanges
            .values()
            .find(|exchange| &exchange.contact_id == contact_id && !exchange.is_terminal())
            .cloned())
    }

    async fn list_by_state(&self, state: ExchangeState) -> Result<Vec<Exchange>, RepositoryError> {
        let exchanges = self.exchanges.read().await;
        let mut listed: Vec<Exchange> =
            exchanges.values().filter(|exchange| exchange.state == state).cloned().collect();
        listed.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then_with(|| a.exchange_id.cmp(&b.exchange_id))
        });
        Ok(listed)
    }

    async fn count_by_state(&self) -> Result<Vec<(ExchangeState, u64)>, RepositoryError> {
        let exchanges = self.exchanges.read().await;
        let mut counts: BTreeMap<&'static str, (ExchangeState, u64)> = BTreeMap::new();
        for exchange in exchanges.values() {
            counts.entry(exchange.state.as_str()).or_insert((exchange.state, 0)).1 += 1;
        }
        Ok(counts.into_values().collect())
    }

    async fn save(&self, exchange: Exchange) -> Result<(), RepositoryError> {
        let mut exchanges = self.exchanges.write().await;
        Self::check_write(&exchanges, &exchange)?;
        exchanges.insert(exchange.exchange_id.0.clone(), exchange);
        Ok(())
    }

    async fn append_turn(&self, turn: ConversationTurn) -> Result<(), RepositoryError> {
        let mut turns = self.turns.write().await;
        let entry = turns.entry(turn.exchange_id.0.clone()).or_default();
        if entry.iter().any(|existing| existing.turn_id == turn.turn_id) {
            return Err(RepositoryError::Conflict(format!(
                "duplicate conversation turn `{}`",
                turn.turn_id
            )));
        }
        entry.push(turn);
        Ok(())
    }

    async fn list_turns(
        &self,
        exchange_id: &ExchangeId,
    ) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let turns = self.turns.read().await;
        Ok(turns.get(&exchange_id.0).cloned().unwrap_or_default())
    }

    async fn commit_terminal(
        &self,
        exchange: Exchange,
        contact: Contact,
    ) -> Result<(), RepositoryError> {
        let mut exchanges = self.exchanges.write().await;
        Self::check_write(&exchanges, &exchange)?;
        self.contacts.save(contact).await?;
        exchanges.insert(exchange.exchange_id.0.clone(), exchange);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryExecutionTaskRepository {
    tasks: RwLock<HashMap<String, ExecutionTask>>,
}

#[async_trait::async_trait]
impl ExecutionTaskRepository for InMemoryExecutionTaskRepository {
    async fn find_by_id(&self, id: &TaskId) -> Result<Option<ExecutionTask>, RepositoryError> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(&id.0).cloned())
    }

    async fn list_for_exchange(
        &self,
        exchange_id: &ExchangeId,
    ) -> Result<Vec<ExecutionTask>, RepositoryError> {
        let tasks = self.tasks.read().await;
        let mut listed: Vec<ExecutionTask> =
            tasks.values().filter(|task| &task.exchange_id == exchange_id).cloned().collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.task_id.cmp(&b.task_id)));
        Ok(listed)
    }

    async fn save(&self, task: ExecutionTask) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.task_id.0.clone(), task);
        Ok(())
    }

    async fn save_all(&self, planned: Vec<ExecutionTask>) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.write().await;
        for task in planned {
            tasks.insert(task.task_id.0.clone(), task);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryWorkerRepository {
    workers: RwLock<BTreeMap<String, WorkerIdentity>>,
}

#[async_trait::async_trait]
impl WorkerRepository for InMemoryWorkerRepository {
    async fn find_by_id(&self, id: &WorkerId) -> Result<Option<WorkerIdentity>, RepositoryError> {
        let workers = self.workers.read().await;
        Ok(workers.get(&id.0).cloned())
    }

    async fn list(&self) -> Result<Vec<WorkerIdentity>, RepositoryError> {
        let workers = self.workers.read().await;
        Ok(workers.values().cloned().collect())
    }

    async fn save(&self, worker: WorkerIdentity) -> Result<(), RepositoryError> {
        let mut workers = self.workers.write().await;
        workers.insert(worker.worker_id.0.clone(), worker);
        Ok(())
    }
}
