//! Seams between the conversation runtime, the executor and the messaging transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::exchange::{Exchange, ExchangeId};
use crate::domain::execution::TaskId;
use crate::domain::message::{
    DeliveryFailure, FulfillmentConfirmation, InboundMessage, OutboundMessage,
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("outbound delivery failed: {0}")]
    Delivery(String),
    #[error("execution handoff failed: {0}")]
    Handoff(String),
    #[error("inbound handling failed: {0}")]
    Handler(String),
}

#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), PortError>;
}

/// Fire-and-forget submission of agreed exchanges to the executor.
#[async_trait]
pub trait ExecutionHandoff: Send + Sync {
    async fn submit(&self, exchange: Exchange) -> Result<(), PortError>;
    async fn cancel(&self, exchange_id: &ExchangeId) -> Result<(), PortError>;
}

/// Outcome of our side of an exchange, keyed only by exchange id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionReport {
    OurFulfillmentComplete { exchange_id: ExchangeId },
    RequiredTaskFailed { exchange_id: ExchangeId, task_id: TaskId, detail: String },
}

impl ExecutionReport {
    pub fn exchange_id(&self) -> &ExchangeId {
        match self {
            Self::OurFulfillmentComplete { exchange_id }
            | Self::RequiredTaskFailed { exchange_id, .. } => exchange_id,
        }
    }
}

#[async_trait]
pub trait ExecutionReportSink: Send + Sync {
    async fn report(&self, report: ExecutionReport);
}

#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_message(&self, message: InboundMessage) -> Result<(), PortError>;
    async fn handle_delivery_failure(&self, failure: DeliveryFailure) -> Result<(), PortError>;
    async fn handle_fulfillment(
        &self,
        confirmation: FulfillmentConfirmation,
    ) -> Result<(), PortError>;
}
