use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::exchange::ExchangeId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub String);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// Closed set of message intents. Decided once by the classifier and never re-interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Interested,
    Accept,
    CounterOffer,
    Decline,
    Question,
    Spam,
    Abusive,
    Irrelevant,
}

impl Intent {
    pub const ALL: [Intent; 8] = [
        Self::Interested,
        Self::Accept,
        Self::CounterOffer,
        Self::Decline,
        Self::Question,
        Self::Spam,
        Self::Abusive,
        Self::Irrelevant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interested => "interested",
            Self::Accept => "accept",
            Self::CounterOffer => "counter_offer",
            Self::Decline => "decline",
            Self::Question => "question",
            Self::Spam => "spam",
            Self::Abusive => "abusive",
            Self::Irrelevant => "irrelevant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "interested" => Some(Self::Interested),
            "accept" => Some(Self::Accept),
            "counter_offer" => Some(Self::CounterOffer),
            "decline" => Some(Self::Decline),
            "question" => Some(Self::Question),
            "spam" => Some(Self::Spam),
            "abusive" => Some(Self::Abusive),
            "irrelevant" => Some(Self::Irrelevant),
            _ => None,
        }
    }

    pub fn is_hostile(&self) -> bool {
        matches!(self, Self::Spam | Self::Abusive)
    }
}

/// Classifier output. `confidence` and `severity` are on a 0..=100 scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: u8,
    pub severity: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_id: TurnId,
    pub exchange_id: ExchangeId,
    pub direction: Direction,
    pub raw_text: String,
    pub classified_intent: Option<Intent>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn inbound(
        exchange_id: ExchangeId,
        raw_text: impl Into<String>,
        intent: Intent,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            turn_id: TurnId(Uuid::new_v4().to_string()),
            exchange_id,
            direction: Direction::Inbound,
            raw_text: raw_text.into(),
            classified_intent: Some(intent),
            timestamp,
        }
    }

    pub fn outbound(
        exchange_id: ExchangeId,
        raw_text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            turn_id: TurnId(Uuid::new_v4().to_string()),
            exchange_id,
            direction: Direction::Outbound,
            raw_text: raw_text.into(),
            classified_intent: None,
            timestamp,
        }
    }
}
