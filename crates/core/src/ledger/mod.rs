//! Exchange ledger rules.
//!
//! Pure state changes on [`Exchange`] and [`Contact`] records. The agent crate wraps these
//! in a store-backed service that commits each change durably before it is observed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::NegotiationConfig;
use crate::domain::contact::Contact;
use crate::domain::exchange::{
    Exchange, ExchangeId, ExchangeOutcome, ExchangeState, FulfillmentStatus, Proposal,
};
use crate::errors::LedgerError;

/// `r' = r * decay + w * (1 - decay)`, clamped to `[0, 1]`.
pub fn update_reliability(score: f64, weight: f64, decay: f64) -> f64 {
    let decay = decay.clamp(0.0, 1.0);
    let updated = score * decay + weight * (1.0 - decay);
    if updated.is_finite() {
        updated.clamp(0.0, 1.0)
    } else {
        score.clamp(0.0, 1.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalChange {
    Applied,
    /// Same outcome was already recorded; nothing changed.
    Unchanged,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LedgerRules {
    pub reliability_decay: f64,
    pub failure_cooldown_secs: u64,
}

impl Default for LedgerRules {
    fn default() -> Self {
        Self::from(&NegotiationConfig::default())
    }
}

impl From<&NegotiationConfig> for LedgerRules {
    fn from(config: &NegotiationConfig) -> Self {
        Self {
            reliability_decay: config.reliability_decay,
            failure_cooldown_secs: config.failure_cooldown_secs,
        }
    }
}

impl LedgerRules {
    pub fn open(
        &self,
        contact: &Contact,
        active: Option<&Exchange>,
        proposal: Proposal,
        now: DateTime<Utc>,
    ) -> Result<Exchange, LedgerError> {
        if !contact.is_available(now) {
            return Err(LedgerError::ContactBlocked(contact.contact_id.clone()));
        }
        if let Some(active) = active.filter(|exchange| !exchange.is_terminal()) {
            return Err(LedgerError::InvalidState {
                exchange_id: active.exchange_id.clone(),
                state: active.state,
                reason: "contact already has an active exchange".to_string(),
            });
        }

        Ok(Exchange {
            exchange_id: ExchangeId(format!("EX-{}", Uuid::new_v4().simple())),
            contact_id: contact.contact_id.clone(),
            state: ExchangeState::Init,
            terms_offered: proposal.offered,
            terms_requested: proposal.requested,
            negotiation_round: 0,
            created_at: now,
            agreed_at: None,
            completed_at: None,
            fulfillment_deadline: None,
            our_fulfillment_status: FulfillmentStatus::Pending,
            their_fulfillment_status: FulfillmentStatus::Pending,
            state_version: 1,
        })
    }

    pub fn ensure_accepts_turns(&self, exchange: &Exchange) -> Result<(), LedgerError> {
        if exchange.is_terminal() {
            return Err(invalid_state(exchange, "turns cannot be appended to a terminal exchange"));
        }
        Ok(())
    }

    /// Moves a live exchange along a non-terminal edge already validated by the flow engine.
    pub fn advance(&self, exchange: &mut Exchange, to: ExchangeState) -> Result<(), LedgerError> {
        if exchange.is_terminal() || to.is_terminal() {
            return Err(invalid_state(exchange, "terminal moves go through mark_terminal"));
        }
        if to == ExchangeState::Agreed || to == ExchangeState::Executing {
            return Err(invalid_state(exchange, "agreement and handoff have dedicated operations"));
        }
        if exchange.state != to {
            exchange.state = to;
            exchange.state_version += 1;
        }
        Ok(())
    }

    /// Replaces the pending proposal and counts one negotiation round.
    pub fn propose(&self, exchange: &mut Exchange, proposal: Proposal) -> Result<(), LedgerError> {
        if !exchange.state.accepts_proposals() {
            return Err(invalid_state(exchange, "terms are frozen"));
        }
        exchange.terms_offered = proposal.offered;
        exchange.terms_requested = proposal.requested;
        exchange.negotiation_round = exchange.negotiation_round.saturating_add(1);
        exchange.state_version += 1;
        Ok(())
    }

    pub fn agree(
        &self,
        exchange: &mut Exchange,
        final_terms: &Proposal,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if exchange.state != ExchangeState::Negotiating {
            return Err(invalid_state(exchange, "agreement requires an open negotiation"));
        }
        if exchange.proposal() != *final_terms {
            return Err(LedgerError::TermsMismatch(exchange.exchange_id.clone()));
        }
        exchange.state = ExchangeState::Agreed;
        exchange.agreed_at = Some(now);
        exchange.state_version += 1;
        Ok(())
    }

    /// AGREED -> EXECUTING once the orchestrator owns the tasks; starts the fulfillment clock.
    pub fn begin_execution(
        &self,
        exchange: &mut Exchange,
        deadline_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if exchange.state != ExchangeState::Agreed {
            return Err(invalid_state(exchange, "only agreed exchanges can be executed"));
        }
        let deadline = i64::try_from(deadline_secs).unwrap_or(i64::MAX / 1_000);
        exchange.state = ExchangeState::Executing;
        exchange.fulfillment_deadline = Some(now + Duration::seconds(deadline));
        exchange.our_fulfillment_status = FulfillmentStatus::InProgress;
        exchange.state_version += 1;
        Ok(())
    }

    pub fn record_our_fulfillment(
        &self,
        exchange: &mut Exchange,
        status: FulfillmentStatus,
    ) -> Result<(), LedgerError> {
        if exchange.is_terminal() {
            return Err(invalid_state(exchange, "fulfillment of a terminal exchange is fixed"));
        }
        exchange.our_fulfillment_status = status;
        exchange.state_version += 1;
        Ok(())
    }

    /// `fulfilled = false` only marks the counterparty unconfirmed; the deadline decides failure.
    pub fn record_their_fulfillment(
        &self,
        exchange: &mut Exchange,
        fulfilled: bool,
    ) -> Result<(), LedgerError> {
        if exchange.is_terminal() {
            return Err(invalid_state(exchange, "fulfillment of a terminal exchange is fixed"));
        }
        exchange.their_fulfillment_status =
            if fulfilled { FulfillmentStatus::Fulfilled } else { FulfillmentStatus::Unconfirmed };
        exchange.state_version += 1;
        Ok(())
    }

    /// Records the terminal outcome and its reliability side effect on the contact.
    ///
    /// Idempotent for a repeated outcome: neither record changes and `completed_at` keeps
    /// its first value. A different outcome is rejected with `AlreadyTerminal`.
    pub fn mark_terminal(
        &self,
        exchange: &mut Exchange,
        contact: &mut Contact,
        outcome: ExchangeOutcome,
        now: DateTime<Utc>,
    ) -> Result<TerminalChange, LedgerError> {
        if let Some(existing) = exchange.outcome() {
            if existing == outcome {
                return Ok(TerminalChange::Unchanged);
            }
            return Err(LedgerError::AlreadyTerminal {
                exchange_id: exchange.exchange_id.clone(),
                existing,
            });
        }
        if exchange.contact_id != contact.contact_id {
            return Err(invalid_state(exchange, "contact does not own this exchange"));
        }

        exchange.state = outcome.state();
        exchange.completed_at = Some(now);
        exchange.state_version += 1;
        match outcome {
            ExchangeOutcome::Completed => {
                exchange.our_fulfillment_status = FulfillmentStatus::Fulfilled;
                exchange.their_fulfillment_status = FulfillmentStatus::Fulfilled;
            }
            ExchangeOutcome::Failed => {
                if exchange.their_fulfillment_status != FulfillmentStatus::Fulfilled {
                    exchange.their_fulfillment_status = FulfillmentStatus::Unconfirmed;
                }
                if exchange.our_fulfillment_status != FulfillmentStatus::Fulfilled {
                    exchange.our_fulfillment_status = FulfillmentStatus::Failed;
                }
            }
            ExchangeOutcome::Abandoned | ExchangeOutcome::Blocked => {}
        }

        contact.reliability_score =
            update_reliability(contact.reliability_score, outcome.weight(), self.reliability_decay);
        contact.touch(now);
        match outcome {
            ExchangeOutcome::Completed => {
                contact.completed_exchanges = contact.completed_exchanges.saturating_add(1);
            }
            ExchangeOutcome::Failed => {
                contact.failed_exchanges = contact.failed_exchanges.saturating_add(1);
                if self.failure_cooldown_secs > 0 {
                    let cooldown = i64::try_from(self.failure_cooldown_secs).unwrap_or(i64::MAX / 1_000);
                    contact.cooldown_until = Some(now + Duration::seconds(cooldown));
                }
            }
            ExchangeOutcome::Blocked => {
                contact.failed_exchanges = contact.failed_exchanges.saturating_add(1);
                contact.blocked = true;
            }
            ExchangeOutcome::Abandoned => {}
        }

        Ok(TerminalChange::Applied)
    }
}

fn invalid_state(exchange: &Exchange, reason: &str) -> LedgerError {
    LedgerError::InvalidState {
        exchange_id: exchange.exchange_id.clone(),
        state: exchange.state,
        reason: reason.to_string(),
    }
}
