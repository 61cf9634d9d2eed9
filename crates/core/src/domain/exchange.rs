use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::contact::ContactId;
use crate::domain::conversation::ConversationTurn;
use crate::domain::execution::ExecutionTask;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeId(pub String);

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    View,
    Endorse,
    Subscribe,
    Comment,
}

impl ActionType {
    pub const ALL: [ActionType; 4] = [Self::View, Self::Endorse, Self::Subscribe, Self::Comment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Endorse => "endorse",
            Self::Subscribe => "subscribe",
            Self::Comment => "comment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "view" => Some(Self::View),
            "endorse" => Some(Self::Endorse),
            "subscribe" => Some(Self::Subscribe),
            "comment" => Some(Self::Comment),
            _ => None,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One obligation within an exchange.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    pub action_type: ActionType,
    pub target_reference: String,
    pub quantity: u32,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl Term {
    pub fn new(action_type: ActionType, target_reference: impl Into<String>, quantity: u32) -> Self {
        Self { action_type, target_reference: target_reference.into(), quantity, required: true }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// The pair of obligations under negotiation: what we do and what we ask in return.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub offered: Vec<Term>,
    pub requested: Vec<Term>,
}

impl Proposal {
    pub fn new(offered: Vec<Term>, requested: Vec<Term>) -> Self {
        Self { offered, requested }
    }

    pub fn is_empty(&self) -> bool {
        self.offered.is_empty() && self.requested.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    Init,
    Contacted,
    Negotiating,
    Agreed,
    Executing,
    Completed,
    Failed,
    Abandoned,
    Blocked,
}

impl ExchangeState {
    pub const ALL: [ExchangeState; 9] = [
        Self::Init,
        Self::Contacted,
        Self::Negotiating,
        Self::Agreed,
        Self::Executing,
        Self::Completed,
        Self::Failed,
        Self::Abandoned,
        Self::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Contacted => "contacted",
            Self::Negotiating => "negotiating",
            Self::Agreed => "agreed",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "init" => Some(Self::Init),
            "contacted" => Some(Self::Contacted),
            "negotiating" => Some(Self::Negotiating),
            "agreed" => Some(Self::Agreed),
            "executing" => Some(Self::Executing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "abandoned" => Some(Self::Abandoned),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned | Self::Blocked)
    }

    /// Whether the proposal may still change. Terms freeze at agreement.
    pub fn accepts_proposals(&self) -> bool {
        matches!(self, Self::Init | Self::Contacted | Self::Negotiating)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Pending,
    InProgress,
    Fulfilled,
    Unconfirmed,
    Failed,
}

impl FulfillmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Fulfilled => "fulfilled",
            Self::Unconfirmed => "unconfirmed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "fulfilled" => Some(Self::Fulfilled),
            "unconfirmed" => Some(Self::Unconfirmed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Terminal outcome recorded by the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeOutcome {
    Completed,
    Failed,
    Abandoned,
    Blocked,
}

impl ExchangeOutcome {
    pub fn state(&self) -> ExchangeState {
        match self {
            Self::Completed => ExchangeState::Completed,
            Self::Failed => ExchangeState::Failed,
            Self::Abandoned => ExchangeState::Abandoned,
            Self::Blocked => ExchangeState::Blocked,
        }
    }

    pub fn from_state(state: ExchangeState) -> Option<Self> {
        match state {
            ExchangeState::Completed => Some(Self::Completed),
            ExchangeState::Failed => Some(Self::Failed),
            ExchangeState::Abandoned => Some(Self::Abandoned),
            ExchangeState::Blocked => Some(Self::Blocked),
            _ => None,
        }
    }

    /// Weight fed into the reliability moving average.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Completed => 1.0,
            Self::Failed | Self::Abandoned | Self::Blocked => 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub exchange_id: ExchangeId,
    pub contact_id: ContactId,
    pub state: ExchangeState,
    pub terms_offered: Vec<Term>,
    pub terms_requested: Vec<Term>,
    pub negotiation_round: u32,
    pub created_at: DateTime<Utc>,
    pub agreed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub fulfillment_deadline: Option<DateTime<Utc>>,
    pub our_fulfillment_status: FulfillmentStatus,
    pub their_fulfillment_status: FulfillmentStatus,
    pub state_version: u32,
}

impl Exchange {
    pub fn proposal(&self) -> Proposal {
        Proposal { offered: self.terms_offered.clone(), requested: self.terms_requested.clone() }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn outcome(&self) -> Option<ExchangeOutcome> {
        ExchangeOutcome::from_state(self.state)
    }
}

/// Full audit view of an exchange: the record, its negotiation log and its execution tasks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSnapshot {
    pub exchange: Exchange,
    pub turns: Vec<ConversationTurn>,
    pub tasks: Vec<ExecutionTask>,
}

impl ExchangeSnapshot {
    /// Hex SHA-256 of the canonical JSON encoding, stamped on audit exports.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let encoded = serde_json::to_vec(self)?;
        let hash = Sha256::digest(&encoded);
        Ok(hash.iter().map(|byte| format!("{byte:02x}")).collect())
    }
}
