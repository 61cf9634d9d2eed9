use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::exchange::ActionType;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    CoolingDown,
    Retired,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::CoolingDown => "cooling_down",
            Self::Retired => "retired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "cooling_down" => Some(Self::CoolingDown),
            "retired" => Some(Self::Retired),
            _ => None,
        }
    }
}

/// A rate-limited automation identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub worker_id: WorkerId,
    pub daily_action_count: u32,
    pub daily_action_cap: u32,
    /// UTC day the counter belongs to; a different day means the counter is stale.
    pub counter_day: NaiveDate,
    pub last_used_at: Option<DateTime<Utc>>,
    pub ban_signal_score: f64,
    pub status: WorkerStatus,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub cooldown_count: u32,
    /// Empty means every action type is supported.
    pub supported_actions: BTreeSet<ActionType>,
}

impl WorkerIdentity {
    pub fn new(worker_id: WorkerId, daily_action_cap: u32, now: DateTime<Utc>) -> Self {
        Self {
            worker_id,
            daily_action_count: 0,
            daily_action_cap,
            counter_day: now.date_naive(),
            last_used_at: None,
            ban_signal_score: 0.0,
            status: WorkerStatus::Active,
            cooldown_until: None,
            cooldown_count: 0,
            supported_actions: BTreeSet::new(),
        }
    }

    pub fn with_supported_actions(mut self, actions: impl IntoIterator<Item = ActionType>) -> Self {
        self.supported_actions = actions.into_iter().collect();
        self
    }

    pub fn supports(&self, action_type: ActionType) -> bool {
        self.supported_actions.is_empty() || self.supported_actions.contains(&action_type)
    }

    /// Resets the daily counter when `now` falls on a later UTC day.
    pub fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.counter_day {
            self.counter_day = today;
            self.daily_action_count = 0;
        }
    }
}
