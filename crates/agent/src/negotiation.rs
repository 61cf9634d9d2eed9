//! Proposal policy and outbound message rendering.

use std::collections::HashMap;

use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;

use tradeback_core::config::NegotiationConfig;
use tradeback_core::domain::contact::ContactId;
use tradeback_core::domain::exchange::{ActionType, Proposal, Term};
use tradeback_core::flows::FlowAction;

use crate::classifier::TermMention;

/// Heading rendered above every restated proposal. The classifier reads it back from
/// history to decide whether a bare "ok" accepts.
pub const PROPOSAL_MARKER: &str = "Proposed exchange:";

const TEMPLATES: [(&str, &str); 10] = [
    ("terms.txt", include_str!("../templates/terms.txt")),
    ("opening.txt", include_str!("../templates/opening.txt")),
    ("proposal.txt", include_str!("../templates/proposal.txt")),
    ("counter.txt", include_str!("../templates/counter.txt")),
    ("answer.txt", include_str!("../templates/answer.txt")),
    ("agreement.txt", include_str!("../templates/agreement.txt")),
    ("decline.txt", include_str!("../templates/decline.txt")),
    ("abandon.txt", include_str!("../templates/abandon.txt")),
    ("failure.txt", include_str!("../templates/failure.txt")),
    ("completion.txt", include_str!("../templates/completion.txt")),
];

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("failed to load message templates: {0}")]
    Templates(#[source] tera::Error),
    #[error("failed to render `{template}`: {source}")]
    Render { template: &'static str, source: tera::Error },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Opening,
    Proposal,
    CounterProposal,
    Answer,
    AgreementConfirmation,
    DeclineNotice,
    AbandonNotice,
    FailureNotice,
    CompletionNotice,
}

impl MessageKind {
    pub fn for_action(action: FlowAction) -> Option<Self> {
        match action {
            FlowAction::SendOpening => Some(Self::Opening),
            FlowAction::SendProposal => Some(Self::Proposal),
            FlowAction::SendCounterProposal => Some(Self::CounterProposal),
            FlowAction::AnswerQuestion => Some(Self::Answer),
            FlowAction::SendAgreementConfirmation => Some(Self::AgreementConfirmation),
            FlowAction::SendDeclineNotice => Some(Self::DeclineNotice),
            FlowAction::SendAbandonNotice => Some(Self::AbandonNotice),
            FlowAction::SendFailureNotice => Some(Self::FailureNotice),
            FlowAction::SendCompletionNotice => Some(Self::CompletionNotice),
            _ => None,
        }
    }

    fn template(&self) -> &'static str {
        match self {
            Self::Opening => "opening.txt",
            Self::Proposal => "proposal.txt",
            Self::CounterProposal => "counter.txt",
            Self::Answer => "answer.txt",
            Self::AgreementConfirmation => "agreement.txt",
            Self::DeclineNotice => "decline.txt",
            Self::AbandonNotice => "abandon.txt",
            Self::FailureNotice => "failure.txt",
            Self::CompletionNotice => "completion.txt",
        }
    }
}

pub struct MessageContext<'a> {
    pub display_name: &'a str,
    pub proposal: &'a Proposal,
    pub round: u32,
    pub max_rounds: u32,
    pub deadline_hours: u64,
    pub reason: Option<&'a str>,
}

#[derive(Serialize)]
struct TermView {
    label: &'static str,
    quantity: u32,
    required: bool,
}

impl From<&Term> for TermView {
    fn from(term: &Term) -> Self {
        Self { label: action_label(term.action_type), quantity: term.quantity, required: term.required }
    }
}

pub struct MessageRenderer {
    tera: Tera,
}

impl MessageRenderer {
    pub fn new() -> Result<Self, NegotiationError> {
        let mut tera = Tera::default();
        tera.register_filter("plural", plural_filter);
        tera.add_raw_templates(TEMPLATES.to_vec()).map_err(NegotiationError::Templates)?;
        Ok(Self { tera })
    }

    pub fn render(&self, kind: MessageKind, message: &MessageContext<'_>) -> Result<String, NegotiationError> {
        let offered: Vec<TermView> = message.proposal.offered.iter().map(TermView::from).collect();
        let requested: Vec<TermView> =
            message.proposal.requested.iter().map(TermView::from).collect();

        let mut context = Context::new();
        context.insert("display_name", message.display_name);
        context.insert("offered", &offered);
        context.insert("requested", &requested);
        context.insert("round", &message.round);
        context.insert("max_rounds", &message.max_rounds);
        context.insert("deadline_hours", &message.deadline_hours);
        context.insert("reason", message.reason.unwrap_or("a required action could not be done"));

        let template = kind.template();
        self.tera
            .render(template, &context)
            .map(|text| text.trim_end().to_string())
            .map_err(|source| NegotiationError::Render { template, source })
    }
}

/// `"view" | plural(count=2)` renders `views`.
fn plural_filter(
    value: &tera::Value,
    args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let word = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("plural filter expects a string input"))?;
    let count = args.get("count").and_then(tera::Value::as_u64).unwrap_or(1);
    let rendered = if count == 1 { word.to_string() } else { format!("{word}s") };
    Ok(tera::Value::String(rendered))
}

fn action_label(action_type: ActionType) -> &'static str {
    match action_type {
        ActionType::View => "view",
        ActionType::Endorse => "endorsement",
        ActionType::Subscribe => "subscription",
        ActionType::Comment => "comment",
    }
}

/// Builds the proposals we put on the table.
///
/// Every proposal is reciprocal: each offered term on the contact's content is mirrored by a
/// requested term of the same action and quantity on ours.
#[derive(Clone, Debug, PartialEq)]
pub struct NegotiationPolicy {
    opening_actions: Vec<ActionType>,
    our_target_reference: String,
    max_term_quantity: u32,
}

impl From<&NegotiationConfig> for NegotiationPolicy {
    fn from(config: &NegotiationConfig) -> Self {
        Self {
            opening_actions: config.opening_actions.clone(),
            our_target_reference: config.our_target_reference.clone(),
            max_term_quantity: config.max_term_quantity.max(1),
        }
    }
}

impl NegotiationPolicy {
    pub fn opening(&self, contact_id: &ContactId) -> Proposal {
        let mentions: Vec<TermMention> = self
            .opening_actions
            .iter()
            .map(|action_type| TermMention { action_type: *action_type, quantity: 1 })
            .collect();
        self.reciprocal(contact_id, &mentions)
    }

    /// Mirrors the counterparty's numbers, clamped to `max_term_quantity`. A counter without
    /// numbers restates what is on the table.
    pub fn counter(&self, contact_id: &ContactId, current: &Proposal, mentions: &[TermMention]) -> Proposal {
        if mentions.is_empty() {
            return current.clone();
        }
        self.reciprocal(contact_id, mentions)
    }

    /// Terms an accept commits to: the pending proposal, or the numbers restated in the accept.
    pub fn accepted_terms(
        &self,
        contact_id: &ContactId,
        current: &Proposal,
        mentions: &[TermMention],
    ) -> Proposal {
        self.counter(contact_id, current, mentions)
    }

    fn reciprocal(&self, contact_id: &ContactId, mentions: &[TermMention]) -> Proposal {
        let clamped = mentions
            .iter()
            .map(|mention| (mention.action_type, mention.quantity.clamp(1, self.max_term_quantity)));

        let mut offered = Vec::with_capacity(mentions.len());
        let mut requested = Vec::with_capacity(mentions.len());
        for (action_type, quantity) in clamped {
            offered.push(Term::new(action_type, contact_id.0.clone(), quantity));
            requested.push(Term::new(action_type, self.our_target_reference.clone(), quantity));
        }
        Proposal::new(offered, requested)
    }
}
