//! Conversation driver for reciprocal engagement exchanges.
//!
//! Inbound text is classified once into an [`Intent`](tradeback_core::Intent), applied to the
//! exchange flow, and answered from fixed templates. Every state change is committed through
//! the [`ledger`] before a reply leaves through the outbound port.
//!
//! - [`classifier`] turns raw text into an intent, a confidence and a severity.
//! - [`negotiation`] builds our proposals and renders outgoing messages.
//! - [`ledger`] is the store-backed ledger service.
//! - [`runtime`] ties them together per contact.

pub mod classifier;
pub mod ledger;
pub mod negotiation;
pub mod runtime;

pub use classifier::{extract_terms, ResponseClassifier, TermMention};
pub use ledger::{ExchangeLedger, LedgerServiceError};
pub use negotiation::{MessageKind, MessageRenderer, NegotiationError, NegotiationPolicy};
pub use runtime::{ConversationRuntime, InboundOutcome, RuntimeDeps, RuntimeError};
