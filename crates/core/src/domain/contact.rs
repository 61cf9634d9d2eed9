use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(pub String);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A counterparty known to the system. Contacts are never deleted, only flagged `blocked`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub contact_id: ContactId,
    pub display_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub reliability_score: f64,
    pub completed_exchanges: u32,
    pub failed_exchanges: u32,
    pub blocked: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl Contact {
    pub fn new(
        contact_id: ContactId,
        display_name: impl Into<String>,
        initial_reliability: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            contact_id,
            display_name: display_name.into(),
            first_seen: now,
            last_seen: now,
            reliability_score: initial_reliability.clamp(0.0, 1.0),
            completed_exchanges: 0,
            failed_exchanges: 0,
            blocked: false,
            cooldown_until: None,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Whether a new negotiation may be opened with this contact at `now`.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        !self.blocked && !self.in_cooldown(now)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{Contact, ContactId};

    #[test]
    fn new_contact_clamps_initial_reliability() {
        let contact = Contact::new(ContactId("c-1".to_string()), "Ada", 1.7, Utc::now());
        assert_eq!(contact.reliability_score, 1.0);
        assert!(!contact.blocked);
    }

    #[test]
    fn cooldown_makes_contact_unavailable_until_expiry() {
        let now = Utc::now();
        let mut contact = Contact::new(ContactId("c-2".to_string()), "Bo", 0.5, now);
        contact.cooldown_until = Some(now + Duration::hours(1));

        assert!(!contact.is_available(now));
        assert!(contact.is_available(now + Duration::hours(2)));
    }

    #[test]
    fn touch_never_moves_last_seen_backwards() {
        let now = Utc::now();
        let mut contact = Contact::new(ContactId("c-3".to_string()), "Cy", 0.5, now);
        contact.touch(now - Duration::minutes(5));
        assert_eq!(contact.last_seen, now);
    }
}
