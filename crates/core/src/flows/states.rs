use serde::{Deserialize, Serialize};

use crate::domain::conversation::Intent;
use crate::domain::exchange::ExchangeState;

pub type FlowState = ExchangeState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
    /// First message sent to or received from a contact.
    ContactInitiated,
    Inbound(Intent),
    HandedOff,
    OurFulfillmentComplete,
    TheirFulfillmentConfirmed,
    RequiredTaskFailed,
    FulfillmentDeadlineElapsed,
    ContactBlocked,
    CancelRequested,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowContext {
    pub negotiation_round: u32,
    pub max_rounds: u32,
    pub severity: u8,
    pub block_severity_threshold: u8,
    pub our_fulfilled: bool,
    pub their_fulfilled: bool,
}

impl Default for FlowContext {
    fn default() -> Self {
        Self {
            negotiation_round: 0,
            max_rounds: 4,
            severity: 0,
            block_severity_threshold: 70,
            our_fulfilled: false,
            their_fulfilled: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    SendOpening,
    SendProposal,
    SendCounterProposal,
    AnswerQuestion,
    FreezeTerms,
    SendAgreementConfirmation,
    HandOffToExecution,
    StartFulfillmentClock,
    CancelExecution,
    SendDeclineNotice,
    SendAbandonNotice,
    SendFailureNotice,
    SendCompletionNotice,
    BlockContact,
    SuppressOutbound,
    UpdateReliability,
}

impl FlowAction {
    pub fn is_outbound_message(&self) -> bool {
        matches!(
            self,
            Self::SendOpening
                | Self::SendProposal
                | Self::SendCounterProposal
                | Self::AnswerQuestion
                | Self::SendAgreementConfirmation
                | Self::SendDeclineNotice
                | Self::SendAbandonNotice
                | Self::SendFailureNotice
                | Self::SendCompletionNotice
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: FlowState,
    pub to: FlowState,
    pub event: FlowEvent,
    pub actions: Vec<FlowAction>,
}

impl TransitionOutcome {
    pub fn changed_state(&self) -> bool {
        self.from != self.to
    }

    pub fn has_action(&self, action: FlowAction) -> bool {
        self.actions.contains(&action)
    }
}
