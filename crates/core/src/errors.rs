use thiserror::Error;

use crate::domain::contact::ContactId;
use crate::domain::exchange::{ExchangeId, ExchangeOutcome, ExchangeState};

/// Rejections raised by the exchange ledger rules. These are refusals, never storage faults.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("contact {0} is blocked or cooling down")]
    ContactBlocked(ContactId),
    #[error("exchange {exchange_id} is {state:?}: {reason}")]
    InvalidState { exchange_id: ExchangeId, state: ExchangeState, reason: String },
    #[error("terms for exchange {0} do not match the last proposal")]
    TermsMismatch(ExchangeId),
    #[error("exchange {exchange_id} already ended as {existing:?}")]
    AlreadyTerminal { exchange_id: ExchangeId, existing: ExchangeOutcome },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
}
