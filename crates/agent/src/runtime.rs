use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use tradeback_core::audit::{AuditContext, AuditSink};
use tradeback_core::config::{ExecutionConfig, NegotiationConfig};
use tradeback_core::domain::contact::{Contact, ContactId};
use tradeback_core::domain::conversation::{ConversationTurn, Intent};
use tradeback_core::domain::exchange::{
    Exchange, ExchangeId, ExchangeOutcome, ExchangeState, FulfillmentStatus,
};
use tradeback_core::domain::message::{
    DeliveryFailure, FulfillmentConfirmation, InboundMessage, OutboundMessage,
};
use tradeback_core::errors::LedgerError;
use tradeback_core::flows::{
    ExchangeFlow, FlowAction, FlowContext, FlowEngine, FlowEvent, FlowTransitionError,
    TransitionOutcome,
};
use tradeback_core::ledger::{LedgerRules, TerminalChange};
use tradeback_core::metrics::MetricsAggregator;
use tradeback_core::ports::{
    ExecutionHandoff, ExecutionReport, ExecutionReportSink, InboundHandler, OutboundSink,
    PortError,
};
use tradeback_db::repositories::{
    ContactRepository, ExchangeRepository, ExecutionTaskRepository, RepositoryError,
};

use crate::classifier::{extract_terms, ResponseClassifier, TermMention};
use crate::ledger::{ExchangeLedger, LedgerServiceError};
use crate::negotiation::{
    MessageContext, MessageKind, MessageRenderer, NegotiationError, NegotiationPolicy,
};

const ACTOR: &str = "conversation-runtime";
const DEADLINE_REASON: &str = "the fulfillment deadline passed";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Flow(#[from] FlowTransitionError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Message(#[from] NegotiationError),
}

impl From<LedgerServiceError> for RuntimeError {
    fn from(error: LedgerServiceError) -> Self {
        match error {
            LedgerServiceError::Rule(error) => Self::Ledger(error),
            LedgerServiceError::Store(error) => Self::Repository(error),
        }
    }
}

impl RuntimeError {
    fn is_persistence(&self) -> bool {
        matches!(self, Self::Repository(RepositoryError::Database(_) | RepositoryError::Decode(_)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundOutcome {
    /// The contact is blocked; nothing was recorded or sent.
    Ignored,
    /// No exchange could be opened because the contact is cooling down.
    Refused,
    Applied { exchange_id: ExchangeId, from: ExchangeState, to: ExchangeState },
    /// An accept restated terms that differ from the pending proposal, which was sent again.
    TermsRestated { exchange_id: ExchangeId },
}

/// One async mutex per key, created on first use.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        lock.lock_owned().await
    }
}

pub struct RuntimeDeps {
    pub contacts: Arc<dyn ContactRepository>,
    pub exchanges: Arc<dyn ExchangeRepository>,
    pub tasks: Arc<dyn ExecutionTaskRepository>,
    pub outbound: Arc<dyn OutboundSink>,
    pub handoff: Arc<dyn ExecutionHandoff>,
    pub metrics: Arc<MetricsAggregator>,
    pub audit: Arc<dyn AuditSink>,
}

/// What drove a transition, beyond the flow event itself.
struct Stimulus<'a> {
    event: FlowEvent,
    severity: u8,
    mentions: &'a [TermMention],
    reason: Option<&'a str>,
    /// Commit the transition without sending its messages.
    quiet: bool,
}

impl Stimulus<'_> {
    fn event(event: FlowEvent) -> Self {
        Self { event, severity: 0, mentions: &[], reason: None, quiet: false }
    }
}

struct PendingMessage {
    contact_id: ContactId,
    text: String,
}

/// Drives every exchange through the flow.
///
/// All work for one contact is serialized by [`KeyedLocks`]; different contacts run in
/// parallel. State changes are committed before any message leaves, and a repository failure
/// aborts the operation with a `PersistenceUnavailable` alert.
pub struct ConversationRuntime {
    config: NegotiationConfig,
    deadline_secs: u64,
    flow: FlowEngine<ExchangeFlow>,
    classifier: ResponseClassifier,
    policy: NegotiationPolicy,
    renderer: MessageRenderer,
    ledger: ExchangeLedger,
    locks: KeyedLocks,
    contacts: Arc<dyn ContactRepository>,
    exchanges: Arc<dyn ExchangeRepository>,
    outbound: Arc<dyn OutboundSink>,
    handoff: Arc<dyn ExecutionHandoff>,
    metrics: Arc<MetricsAggregator>,
    audit: Arc<dyn AuditSink>,
}

impl ConversationRuntime {
    pub fn new(
        negotiation: &NegotiationConfig,
        execution: &ExecutionConfig,
        deps: RuntimeDeps,
    ) -> Result<Self, NegotiationError> {
        let ledger = ExchangeLedger::new(
            LedgerRules::from(negotiation),
            deps.contacts.clone(),
            deps.exchanges.clone(),
            deps.tasks,
        );

        Ok(Self {
            config: negotiation.clone(),
            deadline_secs: execution.fulfillment_deadline_secs,
            flow: FlowEngine::default(),
            classifier: ResponseClassifier::from_config(negotiation),
            policy: NegotiationPolicy::from(negotiation),
            renderer: MessageRenderer::new()?,
            ledger,
            locks: KeyedLocks::default(),
            contacts: deps.contacts,
            exchanges: deps.exchanges,
            outbound: deps.outbound,
            handoff: deps.handoff,
            metrics: deps.metrics,
            audit: deps.audit,
        })
    }

    pub fn ledger(&self) -> &ExchangeLedger {
        &self.ledger
    }

    /// Starts a negotiation on our initiative by sending the opening proposal.
    pub async fn initiate(
        &self,
        contact_id: ContactId,
        display_name: Option<String>,
    ) -> Result<InboundOutcome, RuntimeError> {
        let result = async {
            let _guard = self.locks.lock(&contact_id.0).await;
            let now = Utc::now();
            let contact = self.upsert_contact(&contact_id, display_name.as_deref(), now).await?;
            if contact.blocked {
                return Ok(InboundOutcome::Ignored);
            }
            let Some(exchange) = self.open_exchange(&contact, now).await? else {
                return Ok(InboundOutcome::Refused);
            };
            self.apply(&contact, exchange, Stimulus::event(FlowEvent::ContactInitiated), now).await
        }
        .await;
        self.observe("initiate", result)
    }

    pub async fn handle_inbound(&self, message: InboundMessage) -> Result<InboundOutcome, RuntimeError> {
        let result = self.inbound(message).await;
        self.observe("inbound", result)
    }

    pub async fn handle_report(&self, report: ExecutionReport) -> Result<Option<ExchangeState>, RuntimeError> {
        let result = self.execution_report(report).await;
        self.observe("execution_report", result)
    }

    pub async fn handle_confirmation(
        &self,
        confirmation: FulfillmentConfirmation,
    ) -> Result<Option<ExchangeState>, RuntimeError> {
        let result = self.confirmation(confirmation).await;
        self.observe("fulfillment_confirmation", result)
    }

    /// Resends an undelivered message once, unless the contact is blocked or attempts are
    /// used up. Returns whether the resend went out.
    pub async fn handle_undelivered(&self, failure: DeliveryFailure) -> Result<bool, RuntimeError> {
        let result = async {
            let _guard = self.locks.lock(&failure.contact_id.0).await;
            let blocked = self
                .contacts
                .find_by_id(&failure.contact_id)
                .await?
                .is_some_and(|contact| contact.blocked);
            if blocked {
                debug!(contact_id = %failure.contact_id, "dropping redelivery to blocked contact");
                return Ok(false);
            }
            if failure.attempt >= self.config.outbound_max_attempts {
                warn!(
                    event_name = "runtime.outbound.abandoned",
                    contact_id = %failure.contact_id,
                    attempt = failure.attempt,
                    reason = %failure.reason,
                    "outbound message was not delivered"
                );
                return Ok(false);
            }
            let message = PendingMessage { contact_id: failure.contact_id, text: failure.text };
            Ok(self.send_attempt(message, failure.attempt.saturating_add(1)).await)
        }
        .await;
        self.observe("delivery_failure", result)
    }

    /// Fails executing exchanges whose deadline passed without counterparty confirmation.
    pub async fn sweep_deadlines(&self, now: DateTime<Utc>) -> Result<usize, RuntimeError> {
        let result = async {
            let executing = self.exchanges.list_by_state(ExchangeState::Executing).await?;
            let mut failed = 0;
            for candidate in executing {
                if !candidate.fulfillment_deadline.is_some_and(|deadline| deadline <= now) {
                    continue;
                }

                let _guard = self.locks.lock(&candidate.contact_id.0).await;
                let exchange = self.ledger.exchange(&candidate.exchange_id).await?;
                if exchange.state != ExchangeState::Executing {
                    continue;
                }
                let contact = self.contact(&exchange.contact_id).await?;
                let stimulus = Stimulus {
                    reason: Some(DEADLINE_REASON),
                    ..Stimulus::event(FlowEvent::FulfillmentDeadlineElapsed)
                };
                if let InboundOutcome::Applied { to: ExchangeState::Failed, .. } =
                    self.apply(&contact, exchange, stimulus, now).await?
                {
                    failed += 1;
                }
            }
            Ok(failed)
        }
        .await;
        self.observe("deadline_sweep", result)
    }

    /// Operator cancellation. Ends the exchange `ABANDONED` and stops its execution.
    pub async fn cancel(&self, exchange_id: &ExchangeId) -> Result<ExchangeState, RuntimeError> {
        let result = async {
            let found = self.ledger.exchange(exchange_id).await?;
            let _guard = self.locks.lock(&found.contact_id.0).await;
            let exchange = self.ledger.exchange(exchange_id).await?;
            let contact = self.contact(&exchange.contact_id).await?;
            match self
                .apply(&contact, exchange, Stimulus::event(FlowEvent::CancelRequested), Utc::now())
                .await?
            {
                InboundOutcome::Applied { to, .. } => Ok(to),
                _ => Ok(found.state),
            }
        }
        .await;
        self.observe("cancel", result)
    }

    /// Flags the contact blocked, ending its active exchange `BLOCKED` if there is one.
    pub async fn block_contact(&self, contact_id: &ContactId) -> Result<(), RuntimeError> {
        let result = async {
            let _guard = self.locks.lock(&contact_id.0).await;
            let mut contact = self.contact(contact_id).await?;
            match self.exchanges.find_active_for_contact(contact_id).await? {
                Some(exchange) => {
                    self.apply(&contact, exchange, Stimulus::event(FlowEvent::ContactBlocked), Utc::now())
                        .await?;
                }
                None => {
                    contact.blocked = true;
                    self.contacts.save(contact).await?;
                }
            }
            Ok(())
        }
        .await;
        self.observe("block_contact", result)
    }

    async fn inbound(&self, message: InboundMessage) -> Result<InboundOutcome, RuntimeError> {
        let _guard = self.locks.lock(&message.contact_id.0).await;
        let now = message.received_at;
        let contact = self
            .upsert_contact(&message.contact_id, message.display_name.as_deref(), now)
            .await?;
        if contact.blocked {
            debug!(contact_id = %contact.contact_id, "ignoring message from blocked contact");
            return Ok(InboundOutcome::Ignored);
        }

        let mut exchange = match self.exchanges.find_active_for_contact(&contact.contact_id).await? {
            Some(exchange) => exchange,
            None => match self.open_exchange(&contact, now).await? {
                Some(exchange) => exchange,
                None => return Ok(InboundOutcome::Refused),
            },
        };

        let history = self.exchanges.list_turns(&exchange.exchange_id).await?;
        let classification = self.classifier.classify(&message.raw_text, &history);
        self.ledger
            .record_turn(
                &exchange.exchange_id,
                ConversationTurn::inbound(
                    exchange.exchange_id.clone(),
                    message.raw_text.clone(),
                    classification.intent,
                    now,
                ),
            )
            .await?;

        info!(
            event_name = "runtime.inbound.classified",
            correlation_id = %exchange.exchange_id,
            exchange_id = %exchange.exchange_id,
            contact_id = %contact.contact_id,
            intent = classification.intent.as_str(),
            confidence = classification.confidence,
            severity = classification.severity,
            "inbound message classified"
        );

        // A contact who writes first is contacted implicitly. Questions and small talk get the
        // opening; an answer to it is applied right away and the opening is skipped.
        let opened_by_contact = exchange.state == ExchangeState::Init && !classification.intent.is_hostile();
        if opened_by_contact {
            let answers_opening = matches!(
                classification.intent,
                Intent::Interested | Intent::Accept | Intent::CounterOffer | Intent::Decline
            );
            let opening = Stimulus { quiet: answers_opening, ..Stimulus::event(FlowEvent::ContactInitiated) };
            let opened = self.apply(&contact, exchange, opening, now).await?;
            if !answers_opening {
                return Ok(opened);
            }
            exchange = match &opened {
                InboundOutcome::Applied { exchange_id, .. } => self.ledger.exchange(exchange_id).await?,
                _ => return Ok(opened),
            };
        }

        let mentions = match classification.intent {
            Intent::CounterOffer | Intent::Accept => extract_terms(&message.raw_text),
            _ => Vec::new(),
        };
        let stimulus = Stimulus {
            severity: classification.severity,
            mentions: &mentions,
            ..Stimulus::event(FlowEvent::Inbound(classification.intent))
        };
        match self.apply(&contact, exchange, stimulus, now).await? {
            InboundOutcome::Applied { exchange_id, to, .. } if opened_by_contact => {
                Ok(InboundOutcome::Applied { exchange_id, from: ExchangeState::Init, to })
            }
            outcome => Ok(outcome),
        }
    }

    async fn execution_report(&self, report: ExecutionReport) -> Result<Option<ExchangeState>, RuntimeError> {
        let exchange_id = report.exchange_id().clone();
        let Some(found) = self.exchanges.find_by_id(&exchange_id).await? else {
            warn!(exchange_id = %exchange_id, "execution report for unknown exchange");
            return Ok(None);
        };

        let _guard = self.locks.lock(&found.contact_id.0).await;
        let exchange = self.ledger.exchange(&exchange_id).await?;
        if exchange.state != ExchangeState::Executing {
            debug!(
                exchange_id = %exchange_id,
                state = exchange.state.as_str(),
                "execution report ignored outside EXECUTING"
            );
            return Ok(Some(exchange.state));
        }

        let (status, event, reason) = match &report {
            ExecutionReport::OurFulfillmentComplete { .. } => {
                (FulfillmentStatus::Fulfilled, FlowEvent::OurFulfillmentComplete, None)
            }
            ExecutionReport::RequiredTaskFailed { detail, .. } => {
                (FulfillmentStatus::Failed, FlowEvent::RequiredTaskFailed, Some(detail.as_str()))
            }
        };
        let contact = self.contact(&exchange.contact_id).await?;
        let exchange = self.ledger.record_our_fulfillment(&exchange_id, status).await?;
        let stimulus = Stimulus { reason, ..Stimulus::event(event) };

        match self.apply(&contact, exchange, stimulus, Utc::now()).await? {
            InboundOutcome::Applied { to, .. } => Ok(Some(to)),
            _ => Ok(None),
        }
    }

    async fn confirmation(
        &self,
        confirmation: FulfillmentConfirmation,
    ) -> Result<Option<ExchangeState>, RuntimeError> {
        let exchange_id = confirmation.exchange_id.clone();
        let Some(found) = self.exchanges.find_by_id(&exchange_id).await? else {
            warn!(exchange_id = %exchange_id, "confirmation for unknown exchange");
            return Ok(None);
        };

        let _guard = self.locks.lock(&found.contact_id.0).await;
        let exchange = self.ledger.exchange(&exchange_id).await?;
        if !matches!(exchange.state, ExchangeState::Agreed | ExchangeState::Executing) {
            debug!(
                exchange_id = %exchange_id,
                state = exchange.state.as_str(),
                "confirmation ignored outside AGREED/EXECUTING"
            );
            return Ok(Some(exchange.state));
        }

        let past_deadline = exchange.state == ExchangeState::Executing
            && exchange.fulfillment_deadline.is_some_and(|deadline| confirmation.observed_at > deadline);
        if past_deadline {
            info!(
                event_name = "runtime.fulfillment.late",
                correlation_id = %exchange_id,
                exchange_id = %exchange_id,
                observed_at = %confirmation.observed_at,
                "counterparty fulfillment observed after the deadline"
            );
            let contact = self.contact(&exchange.contact_id).await?;
            let stimulus = Stimulus {
                reason: Some(DEADLINE_REASON),
                ..Stimulus::event(FlowEvent::FulfillmentDeadlineElapsed)
            };
            return match self.apply(&contact, exchange, stimulus, confirmation.observed_at).await? {
                InboundOutcome::Applied { to, .. } => Ok(Some(to)),
                _ => Ok(None),
            };
        }

        let exchange = self.ledger.record_their_fulfillment(&exchange_id, confirmation.fulfilled).await?;
        info!(
            event_name = "runtime.fulfillment.observed",
            correlation_id = %exchange_id,
            exchange_id = %exchange_id,
            fulfilled = confirmation.fulfilled,
            "counterparty fulfillment observed"
        );
        if !confirmation.fulfilled {
            return Ok(Some(exchange.state));
        }

        let contact = self.contact(&exchange.contact_id).await?;
        let stimulus = Stimulus::event(FlowEvent::TheirFulfillmentConfirmed);
        match self.apply(&contact, exchange, stimulus, confirmation.observed_at).await? {
            InboundOutcome::Applied { to, .. } => Ok(Some(to)),
            _ => Ok(None),
        }
    }

    /// Applies one flow event: commits every state change, records outbound turns, then
    /// delivers the messages.
    async fn apply(
        &self,
        contact: &Contact,
        exchange: Exchange,
        stimulus: Stimulus<'_>,
        now: DateTime<Utc>,
    ) -> Result<InboundOutcome, RuntimeError> {
        let exchange_id = exchange.exchange_id.clone();
        let outcome = self.transition(contact, &exchange, stimulus.event, stimulus.severity)?;
        let mut current = exchange;

        if outcome.from == ExchangeState::Init && outcome.to == ExchangeState::Contacted {
            self.metrics.record_negotiation_started();
        }

        if let Some(terminal) = ExchangeOutcome::from_state(outcome.to) {
            let pending = self.prepare_messages(contact, &current, &outcome, stimulus.reason).await?;
            let (closed, change) = self.ledger.mark_terminal(&exchange_id, terminal, now).await?;
            if change == TerminalChange::Applied {
                self.metrics.record_terminal(terminal, now);
                info!(
                    event_name = "runtime.exchange.terminal",
                    correlation_id = %exchange_id,
                    exchange_id = %exchange_id,
                    contact_id = %contact.contact_id,
                    outcome = closed.state.as_str(),
                    "exchange reached a terminal state"
                );
                if outcome.has_action(FlowAction::CancelExecution) {
                    if let Err(error) = self.handoff.cancel(&exchange_id).await {
                        warn!(exchange_id = %exchange_id, error = %error, "execution cancel was not delivered");
                    }
                }
                for message in pending {
                    self.deliver(message).await;
                }
            }
            return Ok(InboundOutcome::Applied { exchange_id, from: outcome.from, to: closed.state });
        }

        for action in &outcome.actions {
            match action {
                FlowAction::SendCounterProposal => {
                    let proposal =
                        self.policy.counter(&contact.contact_id, &current.proposal(), stimulus.mentions);
                    current = self.ledger.propose(&exchange_id, proposal).await?;
                }
                FlowAction::FreezeTerms => {
                    let final_terms = self.policy.accepted_terms(
                        &contact.contact_id,
                        &current.proposal(),
                        stimulus.mentions,
                    );
                    let committed = self
                        .ledger
                        .agree_and_begin_execution(&exchange_id, &final_terms, self.deadline_secs, now)
                        .await;
                    match committed {
                        Ok((agreed, executing)) => {
                            self.metrics.record_agreement(now - agreed.created_at);
                            // Audits AGREED -> EXECUTING; the ledger already committed both.
                            self.transition(contact, &agreed, FlowEvent::HandedOff, 0)?;
                            current = executing;
                        }
                        Err(LedgerServiceError::Rule(LedgerError::TermsMismatch(_))) => {
                            info!(
                                event_name = "runtime.negotiation.terms_mismatch",
                                correlation_id = %exchange_id,
                                exchange_id = %exchange_id,
                                "accept restated different terms; restating proposal"
                            );
                            let restated = self.render_turn(contact, &current, MessageKind::Proposal, None).await?;
                            self.deliver(restated).await;
                            return Ok(InboundOutcome::TermsRestated { exchange_id });
                        }
                        Err(error) => return Err(error.into()),
                    }
                }
                FlowAction::HandOffToExecution => self.hand_off(contact, &current).await,
                _ => {}
            }
        }

        let frozen = matches!(outcome.to, ExchangeState::Agreed | ExchangeState::Executing);
        if !frozen && current.state != outcome.to {
            current = self.ledger.advance(&exchange_id, outcome.to).await?;
        }

        if !stimulus.quiet {
            let pending = self.prepare_messages(contact, &current, &outcome, stimulus.reason).await?;
            for message in pending {
                self.deliver(message).await;
            }
        }

        Ok(InboundOutcome::Applied { exchange_id, from: outcome.from, to: current.state })
    }

    /// Fire-and-forget submission of an executing exchange to the executor.
    async fn hand_off(&self, contact: &Contact, executing: &Exchange) {
        info!(
            event_name = "runtime.exchange.handed_off",
            correlation_id = %executing.exchange_id,
            exchange_id = %executing.exchange_id,
            contact_id = %contact.contact_id,
            task_terms = executing.terms_offered.len(),
            "agreed exchange handed to execution"
        );
        if let Err(error) = self.handoff.submit(executing.clone()).await {
            // The exchange is already EXECUTING; startup resume picks it up.
            error!(exchange_id = %executing.exchange_id, error = %error, "execution handoff failed");
        }
    }

    fn transition(
        &self,
        contact: &Contact,
        exchange: &Exchange,
        event: FlowEvent,
        severity: u8,
    ) -> Result<TransitionOutcome, RuntimeError> {
        let context = FlowContext {
            negotiation_round: exchange.negotiation_round,
            max_rounds: self.config.max_rounds,
            severity,
            block_severity_threshold: self.config.block_severity_threshold,
            our_fulfilled: exchange.our_fulfillment_status == FulfillmentStatus::Fulfilled,
            their_fulfilled: exchange.their_fulfillment_status == FulfillmentStatus::Fulfilled,
        };
        let audit = AuditContext::new(
            Some(exchange.exchange_id.clone()),
            Some(contact.contact_id.clone()),
            exchange.exchange_id.0.clone(),
            ACTOR,
        );
        let outcome =
            self.flow.apply_with_audit(&exchange.state, &event, &context, self.audit.as_ref(), &audit)?;
        debug!(
            exchange_id = %exchange.exchange_id,
            from = outcome.from.as_str(),
            to = outcome.to.as_str(),
            event = ?outcome.event,
            "flow transition applied"
        );
        Ok(outcome)
    }

    async fn prepare_messages(
        &self,
        contact: &Contact,
        exchange: &Exchange,
        outcome: &TransitionOutcome,
        reason: Option<&str>,
    ) -> Result<Vec<PendingMessage>, RuntimeError> {
        if outcome.has_action(FlowAction::SuppressOutbound) {
            return Ok(Vec::new());
        }
        let mut pending = Vec::new();
        for kind in outcome.actions.iter().copied().filter_map(MessageKind::for_action) {
            pending.push(self.render_turn(contact, exchange, kind, reason).await?);
        }
        Ok(pending)
    }

    /// Renders one message and records it as an outbound turn before it is sent.
    async fn render_turn(
        &self,
        contact: &Contact,
        exchange: &Exchange,
        kind: MessageKind,
        reason: Option<&str>,
    ) -> Result<PendingMessage, RuntimeError> {
        let proposal = exchange.proposal();
        let text = self.renderer.render(
            kind,
            &MessageContext {
                display_name: &contact.display_name,
                proposal: &proposal,
                round: exchange.negotiation_round,
                max_rounds: self.config.max_rounds,
                deadline_hours: (self.deadline_secs / 3_600).max(1),
                reason,
            },
        )?;
        self.ledger
            .record_turn(
                &exchange.exchange_id,
                ConversationTurn::outbound(exchange.exchange_id.clone(), text.clone(), Utc::now()),
            )
            .await?;
        Ok(PendingMessage { contact_id: contact.contact_id.clone(), text })
    }

    async fn deliver(&self, message: PendingMessage) {
        self.send_attempt(message, 1).await;
    }

    /// One pass through the outbound port, which owns backoff for synchronous failures.
    /// Further attempts only follow a delivery failure report from the transport.
    async fn send_attempt(&self, message: PendingMessage, attempt: u32) -> bool {
        let outbound = OutboundMessage { contact_id: message.contact_id, text: message.text };
        match self.outbound.send(&outbound).await {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    event_name = "runtime.outbound.failed",
                    contact_id = %outbound.contact_id,
                    attempt,
                    max_attempts = self.config.outbound_max_attempts,
                    error = %error,
                    "outbound message was not delivered"
                );
                false
            }
        }
    }

    async fn open_exchange(&self, contact: &Contact, now: DateTime<Utc>) -> Result<Option<Exchange>, RuntimeError> {
        let proposal = self.policy.opening(&contact.contact_id);
        match self.ledger.open(&contact.contact_id, proposal, now).await {
            Ok(exchange) => {
                info!(
                    event_name = "runtime.exchange.opened",
                    correlation_id = %exchange.exchange_id,
                    exchange_id = %exchange.exchange_id,
                    contact_id = %contact.contact_id,
                    "exchange opened"
                );
                Ok(Some(exchange))
            }
            Err(LedgerServiceError::Rule(LedgerError::ContactBlocked(_))) => {
                info!(contact_id = %contact.contact_id, "contact is cooling down; negotiation refused");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn upsert_contact(
        &self,
        contact_id: &ContactId,
        display_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Contact, RuntimeError> {
        let contact = match self.contacts.find_by_id(contact_id).await? {
            Some(mut contact) => {
                contact.touch(now);
                if let Some(name) = display_name {
                    contact.display_name = name.to_string();
                }
                contact
            }
            None => Contact::new(
                contact_id.clone(),
                display_name.unwrap_or(&contact_id.0),
                self.config.initial_reliability,
                now,
            ),
        };
        self.contacts.save(contact.clone()).await?;
        Ok(contact)
    }

    async fn contact(&self, contact_id: &ContactId) -> Result<Contact, RuntimeError> {
        self.contacts.find_by_id(contact_id).await?.ok_or_else(|| {
            LedgerError::NotFound { entity: "contact", id: contact_id.0.clone() }.into()
        })
    }

    fn observe<T>(&self, operation: &'static str, result: Result<T, RuntimeError>) -> Result<T, RuntimeError> {
        if let Err(error) = &result {
            if error.is_persistence() {
                error!(
                    event_name = "runtime.persistence_failed",
                    operation,
                    error = %error,
                    "operation abandoned before any outbound side effect"
                );
                self.metrics.record_persistence_failure(format!("{operation}: {error}"), Utc::now());
            } else {
                warn!(operation, error = %error, "runtime operation rejected");
            }
        }
        result
    }
}

#[async_trait]
impl InboundHandler for ConversationRuntime {
    async fn handle_message(&self, message: InboundMessage) -> Result<(), PortError> {
        self.handle_inbound(message)
            .await
            .map(|_| ())
            .map_err(|error| PortError::Handler(error.to_string()))
    }

    async fn handle_delivery_failure(&self, failure: DeliveryFailure) -> Result<(), PortError> {
        self.handle_undelivered(failure)
            .await
            .map(|_| ())
            .map_err(|error| PortError::Handler(error.to_string()))
    }

    async fn handle_fulfillment(&self, confirmation: FulfillmentConfirmation) -> Result<(), PortError> {
        self.handle_confirmation(confirmation)
            .await
            .map(|_| ())
            .map_err(|error| PortError::Handler(error.to_string()))
    }
}

#[async_trait]
impl ExecutionReportSink for ConversationRuntime {
    async fn report(&self, report: ExecutionReport) {
        let exchange_id = report.exchange_id().clone();
        if let Err(error) = self.handle_report(report).await {
            warn!(
                event_name = "runtime.execution_report.dropped",
                correlation_id = %exchange_id,
                exchange_id = %exchange_id,
                error = %error,
                "execution report was not applied"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::KeyedLocks;

    #[tokio::test]
    async fn keyed_locks_serialize_same_key_only() {
        let locks = Arc::new(KeyedLocks::default());
        let held = locks.lock("contact-a").await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock("contact-b")).await;
        assert!(other.is_ok(), "different keys must not contend");

        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock("contact-a")).await;
        assert!(same.is_err(), "same key waits for the holder");

        drop(held);
        let reacquired = tokio::time::timeout(Duration::from_millis(50), locks.lock("contact-a")).await;
        assert!(reacquired.is_ok());
    }
}
