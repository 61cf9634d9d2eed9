//! Messaging transport for tradeback.
//!
//! - **Delivery** (`delivery`) - outbound sends with retry and backoff
//! - **Events** (`events`) - inbound envelopes routed to the conversation runtime
//! - **Outbox** (`outbox`) - recording outbound sink for local runs and tests
//!
//! ```text
//! TransportEnvelope → EventDispatcher → InboundHandler (runtime)
//! runtime → OutboundSink::send → TransportOutbound → MessageTransport
//! ```

pub mod delivery;
pub mod events;
pub mod outbox;

pub use delivery::{MessageTransport, NoopTransport, RetryPolicy, TransportError, TransportOutbound};
pub use events::{
    dispatcher_for, DispatchError, EventContext, EventDispatcher, EventHandler,
    EventHandlerError, HandlerResult, TransportEnvelope, TransportEvent, TransportEventType,
};
pub use outbox::InMemoryOutbox;
