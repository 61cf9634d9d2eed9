//! Domain model and pure rules for reciprocal engagement exchanges.
//!
//! Nothing in this crate performs I/O. Persistence lives in `tradeback-db`, the
//! conversation driver in `tradeback-agent` and task execution in `tradeback-executor`.

pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod execution_engine;
pub mod flows;
pub mod ledger;
pub mod metrics;
pub mod ports;
pub mod workers;

pub use domain::contact::{Contact, ContactId};
pub use domain::conversation::{Classification, ConversationTurn, Direction, Intent, TurnId};
pub use domain::exchange::{
    ActionType, Exchange, ExchangeId, ExchangeOutcome, ExchangeSnapshot, ExchangeState,
    FulfillmentStatus, Proposal, Term,
};
pub use domain::execution::{
    ActionRequest, ActionResponse, ActionStatus, ErrorKind, ExecutionTask, TaskId, TaskStatus,
};
pub use domain::message::{DeliveryFailure, FulfillmentConfirmation, InboundMessage, OutboundMessage};
pub use domain::worker::{WorkerId, WorkerIdentity, WorkerStatus};
pub use errors::LedgerError;
pub use execution_engine::{CompletionVerdict, ExecutionError, RetryDecision, TaskEngine};
pub use flows::{FlowAction, FlowContext, FlowEngine, FlowEvent, TransitionOutcome};
pub use ledger::{LedgerRules, TerminalChange};
pub use metrics::{Alert, AlertKind, AlertSeverity, AlertSink, HealthSnapshot, MetricsAggregator};
pub use workers::{Acquisition, AttemptOutcome, PoolSnapshot, WorkerPool, WorkerTransition};
