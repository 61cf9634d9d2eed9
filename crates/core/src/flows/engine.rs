use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::conversation::Intent;
use crate::flows::states::{FlowAction, FlowContext, FlowEvent, FlowState, TransitionOutcome};

pub trait FlowDefinition {
    fn initial_state(&self) -> FlowState;
    fn transition(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

/// The reciprocal exchange protocol: contact, negotiate, agree, execute, settle.
#[derive(Clone, Debug, Default)]
pub struct ExchangeFlow;

impl FlowDefinition for ExchangeFlow {
    fn initial_state(&self) -> FlowState {
        FlowState::Init
    }

    fn transition(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_exchange(current, event, context)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_state(&self) -> FlowState {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, event, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event, context);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(audit, "flow.transition_applied", AuditCategory::Flow, AuditOutcome::Success)
                        .with_metadata("from", outcome.from.as_str())
                        .with_metadata("to", outcome.to.as_str())
                        .with_metadata("event", format!("{:?}", outcome.event)),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(audit, "flow.transition_rejected", AuditCategory::Flow, AuditOutcome::Rejected)
                        .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

impl Default for FlowEngine<ExchangeFlow> {
    fn default() -> Self {
        Self::new(ExchangeFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("exchange is already terminal in {state:?}; event {event:?} ignored")]
    TerminalState { state: FlowState, event: FlowEvent },
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: FlowState, event: FlowEvent },
}

fn transition_exchange(
    current: &FlowState,
    event: &FlowEvent,
    context: &FlowContext,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use FlowAction::{
        AnswerQuestion, BlockContact, CancelExecution, FreezeTerms, HandOffToExecution,
        SendAbandonNotice, SendAgreementConfirmation, SendCompletionNotice, SendCounterProposal,
        SendDeclineNotice, SendFailureNotice, SendOpening, SendProposal, StartFulfillmentClock,
        SuppressOutbound, UpdateReliability,
    };
    use FlowEvent::{
        CancelRequested, ContactBlocked, ContactInitiated, FulfillmentDeadlineElapsed, HandedOff,
        Inbound, OurFulfillmentComplete, RequiredTaskFailed, TheirFulfillmentConfirmed,
    };
    use crate::domain::exchange::ExchangeState::{
        Abandoned, Agreed, Blocked, Completed, Contacted, Executing, Failed, Init, Negotiating,
    };

    if current.is_terminal() {
        return Err(FlowTransitionError::TerminalState { state: *current, event: *event });
    }

    let post_agreement = matches!(current, Agreed | Executing);
    let block_actions = |mut actions: Vec<FlowAction>| {
        if post_agreement {
            actions.insert(0, CancelExecution);
        }
        actions.extend([SuppressOutbound, UpdateReliability]);
        actions
    };

    let (to, actions) = match (current, event) {
        (_, ContactBlocked) => (Blocked, block_actions(Vec::new())),
        (_, Inbound(intent)) if intent.is_hostile() => {
            if context.severity >= context.block_severity_threshold {
                (Blocked, block_actions(vec![BlockContact]))
            } else {
                (*current, Vec::new())
            }
        }
        (Init, ContactInitiated) => (Contacted, vec![SendOpening]),
        (Init, CancelRequested) => (Abandoned, vec![UpdateReliability]),

        (Contacted, Inbound(Intent::Interested)) | (Contacted, Inbound(Intent::Accept)) => {
            (Negotiating, vec![SendProposal])
        }
        (Contacted, Inbound(Intent::CounterOffer)) => (Negotiating, vec![SendCounterProposal]),
        (Negotiating, Inbound(Intent::Interested)) => (Negotiating, vec![SendProposal]),
        (Negotiating, Inbound(Intent::CounterOffer)) => {
            if context.negotiation_round >= context.max_rounds {
                (Abandoned, vec![SendAbandonNotice, UpdateReliability])
            } else {
                (Negotiating, vec![SendCounterProposal])
            }
        }
        (Negotiating, Inbound(Intent::Accept)) => {
            (Agreed, vec![FreezeTerms, SendAgreementConfirmation, HandOffToExecution])
        }
        (Contacted, Inbound(Intent::Decline)) | (Negotiating, Inbound(Intent::Decline)) => {
            (Abandoned, vec![SendDeclineNotice, UpdateReliability])
        }
        (Contacted, CancelRequested) | (Negotiating, CancelRequested) => {
            (Abandoned, vec![SendAbandonNotice, UpdateReliability])
        }

        (Agreed, HandedOff) => (Executing, vec![StartFulfillmentClock]),
        (Agreed, Inbound(Intent::Decline)) | (Executing, Inbound(Intent::Decline)) => {
            (Abandoned, vec![CancelExecution, SendDeclineNotice, UpdateReliability])
        }
        (Agreed, CancelRequested) | (Executing, CancelRequested) => {
            (Abandoned, vec![CancelExecution, SendAbandonNotice, UpdateReliability])
        }
        (Agreed, TheirFulfillmentConfirmed) => (Agreed, Vec::new()),

        (Executing, OurFulfillmentComplete) | (Executing, TheirFulfillmentConfirmed) => {
            if context.our_fulfilled && context.their_fulfilled {
                (Completed, vec![SendCompletionNotice, UpdateReliability])
            } else {
                (Executing, Vec::new())
            }
        }
        (Executing, RequiredTaskFailed) => {
            (Failed, vec![CancelExecution, SendFailureNotice, UpdateReliability])
        }
        (Executing, FulfillmentDeadlineElapsed) => {
            if context.their_fulfilled {
                (Executing, Vec::new())
            } else {
                (Failed, vec![CancelExecution, SendFailureNotice, UpdateReliability])
            }
        }

        (Contacted, Inbound(Intent::Question))
        | (Negotiating, Inbound(Intent::Question))
        | (Agreed, Inbound(Intent::Question))
        | (Executing, Inbound(Intent::Question)) => (*current, vec![AnswerQuestion]),
        (Contacted, Inbound(_))
        | (Negotiating, Inbound(Intent::Irrelevant))
        | (Agreed, Inbound(_))
        | (Executing, Inbound(_)) => (*current, Vec::new()),

        _ => {
            return Err(FlowTransitionError::InvalidTransition { state: *current, event: *event });
        }
    };

    Ok(TransitionOutcome { from: *current, to, event: *event, actions })
}
