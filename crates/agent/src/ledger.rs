//! Store-backed exchange ledger.
//!
//! Each operation loads the exchange by id, applies the pure [`LedgerRules`] change and commits
//! it before returning. Callers serialize operations per contact.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use tradeback_core::domain::contact::{Contact, ContactId};
use tradeback_core::domain::conversation::ConversationTurn;
use tradeback_core::domain::exchange::{
    Exchange, ExchangeId, ExchangeOutcome, ExchangeSnapshot, ExchangeState, FulfillmentStatus,
    Proposal,
};
use tradeback_core::errors::LedgerError;
use tradeback_core::ledger::{LedgerRules, TerminalChange};
use tradeback_db::repositories::{
    ContactRepository, ExchangeRepository, ExecutionTaskRepository, RepositoryError,
};

#[derive(Debug, Error)]
pub enum LedgerServiceError {
    #[error(transparent)]
    Rule(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] RepositoryError),
}

pub struct ExchangeLedger {
    rules: LedgerRules,
    contacts: Arc<dyn ContactRepository>,
    exchanges: Arc<dyn ExchangeRepository>,
    tasks: Arc<dyn ExecutionTaskRepository>,
}

impl ExchangeLedger {
    pub fn new(
        rules: LedgerRules,
        contacts: Arc<dyn ContactRepository>,
        exchanges: Arc<dyn ExchangeRepository>,
        tasks: Arc<dyn ExecutionTaskRepository>,
    ) -> Self {
        Self { rules, contacts, exchanges, tasks }
    }

    pub async fn open(
        &self,
        contact_id: &ContactId,
        proposal: Proposal,
        now: DateTime<Utc>,
    ) -> Result<Exchange, LedgerServiceError> {
        let contact = self.contact(contact_id).await?;
        let active = self.exchanges.find_active_for_contact(contact_id).await?;
        let exchange = self.rules.open(&contact, active.as_ref(), proposal, now)?;
        self.exchanges.save(exchange.clone()).await?;
        Ok(exchange)
    }

    pub async fn record_turn(
        &self,
        exchange_id: &ExchangeId,
        turn: ConversationTurn,
    ) -> Result<(), LedgerServiceError> {
        let exchange = self.exchange(exchange_id).await?;
        self.rules.ensure_accepts_turns(&exchange)?;
        if turn.exchange_id != exchange.exchange_id {
            return Err(LedgerError::InvalidState {
                exchange_id: exchange.exchange_id,
                state: exchange.state,
                reason: "turn belongs to another exchange".to_string(),
            }
            .into());
        }
        self.exchanges.append_turn(turn).await?;
        Ok(())
    }

    pub async fn advance(
        &self,
        exchange_id: &ExchangeId,
        to: ExchangeState,
    ) -> Result<Exchange, LedgerServiceError> {
        self.update(exchange_id, |rules, exchange| rules.advance(exchange, to)).await
    }

    pub async fn propose(
        &self,
        exchange_id: &ExchangeId,
        proposal: Proposal,
    ) -> Result<Exchange, LedgerServiceError> {
        self.update(exchange_id, |rules, exchange| rules.propose(exchange, proposal)).await
    }

    /// Freezes the agreed terms and starts the fulfillment clock in a single commit.
    ///
    /// Returns the exchange as it stood once agreed, then as stored (`EXECUTING`).
    pub async fn agree_and_begin_execution(
        &self,
        exchange_id: &ExchangeId,
        final_terms: &Proposal,
        deadline_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<(Exchange, Exchange), LedgerServiceError> {
        let mut exchange = self.exchange(exchange_id).await?;
        self.rules.agree(&mut exchange, final_terms, now)?;
        let agreed = exchange.clone();
        self.rules.begin_execution(&mut exchange, deadline_secs, now)?;
        self.exchanges.save(exchange.clone()).await?;
        Ok((agreed, exchange))
    }

    pub async fn record_our_fulfillment(
        &self,
        exchange_id: &ExchangeId,
        status: FulfillmentStatus,
    ) -> Result<Exchange, LedgerServiceError> {
        self.update(exchange_id, |rules, exchange| rules.record_our_fulfillment(exchange, status))
            .await
    }

    pub async fn record_their_fulfillment(
        &self,
        exchange_id: &ExchangeId,
        fulfilled: bool,
    ) -> Result<Exchange, LedgerServiceError> {
        self.update(exchange_id, |rules, exchange| rules.record_their_fulfillment(exchange, fulfilled))
            .await
    }

    /// Commits the terminal exchange and the contact's reliability update in one transaction.
    /// A repeated outcome returns [`TerminalChange::Unchanged`] without writing.
    pub async fn mark_terminal(
        &self,
        exchange_id: &ExchangeId,
        outcome: ExchangeOutcome,
        now: DateTime<Utc>,
    ) -> Result<(Exchange, TerminalChange), LedgerServiceError> {
        let mut exchange = self.exchange(exchange_id).await?;
        let mut contact = self.contact(&exchange.contact_id).await?;

        let change = self.rules.mark_terminal(&mut exchange, &mut contact, outcome, now)?;
        if change == TerminalChange::Applied {
            self.exchanges.commit_terminal(exchange.clone(), contact).await?;
        }
        Ok((exchange, change))
    }

    pub async fn snapshot(&self, exchange_id: &ExchangeId) -> Result<ExchangeSnapshot, LedgerServiceError> {
        let exchange = self.exchange(exchange_id).await?;
        let turns = self.exchanges.list_turns(exchange_id).await?;
        let tasks = self.tasks.list_for_exchange(exchange_id).await?;
        Ok(ExchangeSnapshot { exchange, turns, tasks })
    }

    pub async fn exchange(&self, exchange_id: &ExchangeId) -> Result<Exchange, LedgerServiceError> {
        self.exchanges.find_by_id(exchange_id).await?.ok_or_else(|| {
            LedgerError::NotFound { entity: "exchange", id: exchange_id.0.clone() }.into()
        })
    }

    async fn contact(&self, contact_id: &ContactId) -> Result<Contact, LedgerServiceError> {
        self.contacts.find_by_id(contact_id).await?.ok_or_else(|| {
            LedgerError::NotFound { entity: "contact", id: contact_id.0.clone() }.into()
        })
    }

    async fn update<F>(&self, exchange_id: &ExchangeId, change: F) -> Result<Exchange, LedgerServiceError>
    where
        F: FnOnce(&LedgerRules, &mut Exchange) -> Result<(), LedgerError>,
    {
        let mut exchange = self.exchange(exchange_id).await?;
        change(&self.rules, &mut exchange)?;
        self.exchanges.save(exchange.clone()).await?;
        Ok(exchange)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use tradeback_core::domain::contact::{Contact, ContactId};
    use tradeback_core::domain::conversation::{ConversationTurn, Intent};
    use tradeback_core::domain::exchange::{
        ActionType, Exchange, ExchangeId, ExchangeOutcome, ExchangeState, FulfillmentStatus,
        Proposal, Term,
    };
    use tradeback_core::errors::LedgerError;
    use tradeback_core::ledger::{LedgerRules, TerminalChange};
    use tradeback_db::repositories::memory::{
        InMemoryContactRepository, InMemoryExchangeRepository, InMemoryExecutionTaskRepository,
    };
    use tradeback_db::repositories::{ContactRepository, ExchangeRepository, RepositoryError};

    use super::{ExchangeLedger, LedgerServiceError};

    struct Fixture {
        ledger: ExchangeLedger,
        contacts: Arc<InMemoryContactRepository>,
    }

    async fn fixture() -> Fixture {
        let contacts = Arc::new(InMemoryContactRepository::default());
        let exchanges = Arc::new(InMemoryExchangeRepository::with_contacts(contacts.clone()));
        let tasks = Arc::new(InMemoryExecutionTaskRepository::default());
        contacts
            .save(Contact::new(ContactId("c-1".to_string()), "Casey", 0.5, Utc::now()))
            .await
            .expect("seed contact");

        Fixture {
            ledger: ExchangeLedger::new(LedgerRules::default(), contacts.clone(), exchanges, tasks),
            contacts,
        }
    }

    /// Counts exchange writes on top of the in-memory store.
    struct CountingExchanges {
        inner: InMemoryExchangeRepository,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl ExchangeRepository for CountingExchanges {
        async fn find_by_id(&self, id: &ExchangeId) -> Result<Option<Exchange>, RepositoryError> {
            self.inner.find_by_id(id).await
        }

        async fn find_active_for_contact(&self, contact_id: &ContactId) -> Result<Option<Exchange>, RepositoryError> {
            self.inner.find_active_for_contact(contact_id).await
        }

        async fn list_by_state(&self, state: ExchangeState) -> Result<Vec<Exchange>, RepositoryError> {
            self.inner.list_by_state(state).await
        }

        async fn count_by_state(&self) -> Result<Vec<(ExchangeState, u64)>, RepositoryError> {
            self.inner.count_by_state().await
        }

        async fn save(&self, exchange: Exchange) -> Result<(), RepositoryError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(exchange).await
        }

        async fn append_turn(&self, turn: ConversationTurn) -> Result<(), RepositoryError> {
            self.inner.append_turn(turn).await
        }

        async fn list_turns(&self, exchange_id: &ExchangeId) -> Result<Vec<ConversationTurn>, RepositoryError> {
            self.inner.list_turns(exchange_id).await
        }

        async fn commit_terminal(&self, exchange: Exchange, contact: Contact) -> Result<(), RepositoryError> {
            self.inner.commit_terminal(exchange, contact).await
        }
    }

    fn proposal() -> Proposal {
        Proposal::new(
            vec![Term::new(ActionType::View, "c-1", 1)],
            vec![Term::new(ActionType::View, "ours", 1)],
        )
    }

    #[tokio::test]
    async fn open_refuses_second_active_exchange() {
        let fixture = fixture().await;
        let contact_id = ContactId("c-1".to_string());
        fixture.ledger.open(&contact_id, proposal(), Utc::now()).await.expect("first open");

        let error = fixture
            .ledger
            .open(&contact_id, proposal(), Utc::now())
            .await
            .expect_err("second open must be refused");
        assert!(matches!(error, LedgerServiceError::Rule(LedgerError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn agree_rejects_terms_that_differ_from_last_proposal() {
        let fixture = fixture().await;
        let contact_id = ContactId("c-1".to_string());
        let opened = fixture.ledger.open(&contact_id, proposal(), Utc::now()).await.expect("open");
        fixture.ledger.advance(&opened.exchange_id, ExchangeState::Contacted).await.expect("contacted");
        fixture.ledger.advance(&opened.exchange_id, ExchangeState::Negotiating).await.expect("negotiating");

        let mut different = proposal();
        different.offered[0].quantity = 4;
        let error = fixture
            .ledger
            .agree_and_begin_execution(&opened.exchange_id, &different, 3_600, Utc::now())
            .await
            .expect_err("mismatch");
        assert!(matches!(error, LedgerServiceError::Rule(LedgerError::TermsMismatch(_))));

        let unchanged = fixture.ledger.exchange(&opened.exchange_id).await.expect("reload");
        assert_eq!(unchanged.state, ExchangeState::Negotiating);

        let (agreed, _) = fixture
            .ledger
            .agree_and_begin_execution(&opened.exchange_id, &proposal(), 3_600, Utc::now())
            .await
            .expect("matching terms agree");
        assert_eq!(agreed.state, ExchangeState::Agreed);
        assert!(agreed.agreed_at.is_some());
    }

    #[tokio::test]
    async fn mark_terminal_is_idempotent_and_updates_reliability_once() {
        let fixture = fixture().await;
        let contact_id = ContactId("c-1".to_string());
        let opened = fixture.ledger.open(&contact_id, proposal(), Utc::now()).await.expect("open");
        let now = Utc::now();

        let (first, change) = fixture
            .ledger
            .mark_terminal(&opened.exchange_id, ExchangeOutcome::Failed, now)
            .await
            .expect("fail");
        assert_eq!(change, TerminalChange::Applied);
        assert_eq!(first.our_fulfillment_status, FulfillmentStatus::Failed);

        let (again, change) = fixture
            .ledger
            .mark_terminal(&opened.exchange_id, ExchangeOutcome::Failed, now + Duration::minutes(5))
            .await
            .expect("repeat");
        assert_eq!(change, TerminalChange::Unchanged);
        assert_eq!(again.completed_at, first.completed_at);

        let error = fixture
            .ledger
            .mark_terminal(&opened.exchange_id, ExchangeOutcome::Completed, now)
            .await
            .expect_err("different outcome");
        assert!(matches!(error, LedgerServiceError::Rule(LedgerError::AlreadyTerminal { .. })));

        let contact = fixture.contacts.find_by_id(&contact_id).await.expect("load").expect("contact");
        assert_eq!(contact.failed_exchanges, 1);
        assert!((contact.reliability_score - 0.4).abs() < 1e-9);
        assert!(contact.in_cooldown(now + Duration::hours(1)));
    }

    #[tokio::test]
    async fn turns_are_refused_once_terminal_and_kept_in_snapshot() {
        let fixture = fixture().await;
        let contact_id = ContactId("c-1".to_string());
        let opened = fixture.ledger.open(&contact_id, proposal(), Utc::now()).await.expect("open");

        fixture
            .ledger
            .record_turn(
                &opened.exchange_id,
                ConversationTurn::inbound(opened.exchange_id.clone(), "interested", Intent::Interested, Utc::now()),
            )
            .await
            .expect("record turn");
        fixture
            .ledger
            .mark_terminal(&opened.exchange_id, ExchangeOutcome::Abandoned, Utc::now())
            .await
            .expect("abandon");

        let error = fixture
            .ledger
            .record_turn(
                &opened.exchange_id,
                ConversationTurn::outbound(opened.exchange_id.clone(), "late", Utc::now()),
            )
            .await
            .expect_err("terminal exchanges are closed");
        assert!(matches!(error, LedgerServiceError::Rule(LedgerError::InvalidState { .. })));

        let snapshot = fixture.ledger.snapshot(&opened.exchange_id).await.expect("snapshot");
        assert_eq!(snapshot.turns.len(), 1);
        assert_eq!(snapshot.exchange.state, ExchangeState::Abandoned);
        assert!(snapshot.tasks.is_empty());
    }

    #[tokio::test]
    async fn agreement_and_fulfillment_clock_commit_together() {
        let contacts = Arc::new(InMemoryContactRepository::default());
        let exchanges = Arc::new(CountingExchanges {
            inner: InMemoryExchangeRepository::with_contacts(contacts.clone()),
            saves: AtomicUsize::new(0),
        });
        let ledger = ExchangeLedger::new(
            LedgerRules::default(),
            contacts,
            exchanges.clone(),
            Arc::new(InMemoryExecutionTaskRepository::default()),
        );
        let contact_id = ContactId("c-1".to_string());
        let now = Utc::now();
        let opened = ledger.open(&contact_id, proposal(), now).await.expect("open");
        ledger.advance(&opened.exchange_id, ExchangeState::Contacted).await.expect("contacted");
        ledger.advance(&opened.exchange_id, ExchangeState::Negotiating).await.expect("negotiating");

        let before = exchanges.saves.load(Ordering::SeqCst);
        let (agreed, executing) = ledger
            .agree_and_begin_execution(&opened.exchange_id, &proposal(), 3_600, now)
            .await
            .expect("agree and start");
        assert_eq!(exchanges.saves.load(Ordering::SeqCst), before + 1);

        assert_eq!(agreed.state, ExchangeState::Agreed);
        assert_eq!(executing.state, ExchangeState::Executing);
        let stored = ledger.exchange(&opened.exchange_id).await.expect("reload");
        assert_eq!(stored.state, ExchangeState::Executing);
        assert_eq!(stored.agreed_at, Some(now));
        assert_eq!(stored.fulfillment_deadline, Some(now + Duration::seconds(3_600)));
        assert_eq!(stored.our_fulfillment_status, FulfillmentStatus::InProgress);

        let mut different = proposal();
        different.offered[0].quantity = 9;
        let error = ledger
            .agree_and_begin_execution(&opened.exchange_id, &different, 3_600, now)
            .await
            .expect_err("already executing");
        assert!(matches!(error, LedgerServiceError::Rule(LedgerError::InvalidState { .. })));
        assert_eq!(exchanges.saves.load(Ordering::SeqCst), before + 1);
    }
}
