//! Contracts exchanged with the messaging transport and the fulfillment observer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::contact::ContactId;
use crate::domain::exchange::ExchangeId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub contact_id: ContactId,
    #[serde(default)]
    pub display_name: Option<String>,
    pub raw_text: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub contact_id: ContactId,
    pub text: String,
}

/// Asynchronous report that an outbound message could not be delivered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub contact_id: ContactId,
    pub text: String,
    pub attempt: u32,
    pub reason: String,
}

/// Counterparty fulfillment observation from the target platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentConfirmation {
    pub exchange_id: ExchangeId,
    pub fulfilled: bool,
    pub observed_at: DateTime<Utc>,
}
