use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use tradeback_core::domain::message::{
    DeliveryFailure, FulfillmentConfirmation, InboundMessage,
};
use tradeback_core::ports::{InboundHandler, PortError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportEnvelope {
    pub envelope_id: String,
    pub event: TransportEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Message(InboundMessage),
    DeliveryFailed(DeliveryFailure),
    Fulfillment(FulfillmentConfirmation),
    Unsupported { event_type: String },
}

impl TransportEvent {
    pub fn event_type(&self) -> TransportEventType {
        match self {
            Self::Message(_) => TransportEventType::Message,
            Self::DeliveryFailed(_) => TransportEventType::DeliveryFailed,
            Self::Fulfillment(_) => TransportEventType::Fulfillment,
            Self::Unsupported { .. } => TransportEventType::Unsupported,
        }
    }

    pub fn contact_id(&self) -> Option<&str> {
        match self {
            Self::Message(message) => Some(&message.contact_id.0),
            Self::DeliveryFailed(failure) => Some(&failure.contact_id.0),
            Self::Fulfillment(_) | Self::Unsupported { .. } => None,
        }
    }

    pub fn exchange_id(&self) -> Option<&str> {
        match self {
            Self::Fulfillment(confirmation) => Some(&confirmation.exchange_id.0),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TransportEventType {
    Message,
    DeliveryFailed,
    Fulfillment,
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Processed,
    Ignored,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventHandlerError {
    #[error(transparent)]
    Port(#[from] PortError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Handler(#[from] EventHandlerError),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> TransportEventType;
    async fn handle(
        &self,
        envelope: &TransportEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError>;
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<TransportEventType, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(handler.event_type(), Arc::new(handler));
    }

    pub async fn dispatch(
        &self,
        envelope: &TransportEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, DispatchError> {
        let Some(handler) = self.handlers.get(&envelope.event.event_type()) else {
            return Ok(HandlerResult::Ignored);
        };

        handler.handle(envelope, ctx).await.map_err(DispatchError::from)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Routes every supported event kind to one inbound handler.
pub fn dispatcher_for(handler: Arc<dyn InboundHandler>) -> EventDispatcher {
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(MessageEventHandler { inner: handler.clone() });
    dispatcher.register(DeliveryFailureEventHandler { inner: handler.clone() });
    dispatcher.register(FulfillmentEventHandler { inner: handler });
    dispatcher
}

struct MessageEventHandler {
    inner: Arc<dyn InboundHandler>,
}

#[async_trait]
impl EventHandler for MessageEventHandler {
    fn event_type(&self) -> TransportEventType {
        TransportEventType::Message
    }

    async fn handle(
        &self,
        envelope: &TransportEnvelope,
        _ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let TransportEvent::Message(message) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        self.inner.handle_message(message.clone()).await?;
        Ok(HandlerResult::Processed)
    }
}

struct DeliveryFailureEventHandler {
    inner: Arc<dyn InboundHandler>,
}

#[async_trait]
impl EventHandler for DeliveryFailureEventHandler {
    fn event_type(&self) -> TransportEventType {
        TransportEventType::DeliveryFailed
    }

    async fn handle(
        &self,
        envelope: &TransportEnvelope,
        _ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let TransportEvent::DeliveryFailed(failure) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        self.inner.handle_delivery_failure(failure.clone()).await?;
        Ok(HandlerResult::Processed)
    }
}

struct FulfillmentEventHandler {
    inner: Arc<dyn InboundHandler>,
}

#[async_trait]
impl EventHandler for FulfillmentEventHandler {
    fn event_type(&self) -> TransportEventType {
        TransportEventType::Fulfillment
    }

    async fn handle(
        &self,
        envelope: &TransportEnvelope,
        _ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let TransportEvent::Fulfillment(confirmation) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        self.inner.handle_fulfillment(confirmation.clone()).await?;
        Ok(HandlerResult::Processed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;

    use tradeback_core::domain::contact::ContactId;
    use tradeback_core::domain::exchange::ExchangeId;
    use tradeback_core::domain::message::{
        DeliveryFailure, FulfillmentConfirmation, InboundMessage,
    };
    use tradeback_core::ports::{InboundHandler, PortError};

    use super::{
        dispatcher_for, DispatchError, EventContext, EventHandlerError, HandlerResult,
        TransportEnvelope, TransportEvent,
    };

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
        fail_messages: bool,
    }

    impl RecordingHandler {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl InboundHandler for RecordingHandler {
        async fn handle_message(&self, message: InboundMessage) -> Result<(), PortError> {
            if self.fail_messages {
                return Err(PortError::Handler("store offline".to_owned()));
            }
            self.seen.lock().expect("lock").push(format!("message:{}", message.contact_id));
            Ok(())
        }

        async fn handle_delivery_failure(&self, failure: DeliveryFailure) -> Result<(), PortError> {
            self.seen.lock().expect("lock").push(format!("failure:{}", failure.attempt));
            Ok(())
        }

        async fn handle_fulfillment(
            &self,
            confirmation: FulfillmentConfirmation,
        ) -> Result<(), PortError> {
            self.seen.lock().expect("lock").push(format!("fulfillment:{}", confirmation.exchange_id));
            Ok(())
        }
    }

    fn envelope(event: TransportEvent) -> TransportEnvelope {
        TransportEnvelope { envelope_id: "env-1".to_owned(), event }
    }

    #[tokio::test]
    async fn routes_each_event_kind_to_the_inbound_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher_for(handler.clone());
        let ctx = EventContext::default();
        let now = Utc::now();

        let events = [
            TransportEvent::Message(InboundMessage {
                contact_id: ContactId("c-1".to_owned()),
                display_name: None,
                raw_text: "hi".to_owned(),
                received_at: now,
            }),
            TransportEvent::DeliveryFailed(DeliveryFailure {
                contact_id: ContactId("c-1".to_owned()),
                text: "hello".to_owned(),
                attempt: 2,
                reason: "rate limited".to_owned(),
            }),
            TransportEvent::Fulfillment(FulfillmentConfirmation {
                exchange_id: ExchangeId("EX-1".to_owned()),
                fulfilled: true,
                observed_at: now,
            }),
        ];

        for event in events {
            let result = dispatcher.dispatch(&envelope(event), &ctx).await.expect("dispatch");
            assert_eq!(result, HandlerResult::Processed);
        }

        assert_eq!(dispatcher.handler_count(), 3);
        assert_eq!(handler.seen(), vec!["message:c-1", "failure:2", "fulfillment:EX-1"]);
    }

    #[tokio::test]
    async fn unsupported_events_are_ignored() {
        let dispatcher = dispatcher_for(Arc::new(RecordingHandler::default()));
        let result = dispatcher
            .dispatch(
                &envelope(TransportEvent::Unsupported { event_type: "typing".to_owned() }),
                &EventContext::default(),
            )
            .await
            .expect("dispatch");

        assert_eq!(result, HandlerResult::Ignored);
    }

    #[tokio::test]
    async fn handler_failures_surface_as_dispatch_errors() {
        let handler = Arc::new(RecordingHandler { fail_messages: true, ..Default::default() });
        let dispatcher = dispatcher_for(handler);
        let event = TransportEvent::Message(InboundMessage {
            contact_id: ContactId("c-2".to_owned()),
            display_name: Some("Bo".to_owned()),
            raw_text: "deal".to_owned(),
            received_at: Utc::now(),
        });

        let error = dispatcher
            .dispatch(&envelope(event), &EventContext::default())
            .await
            .expect_err("handler failure");
        assert_eq!(
            error,
            DispatchError::Handler(EventHandlerError::Port(PortError::Handler(
                "store offline".to_owned()
            )))
        );
    }
}
