//! Fulfillment of agreed exchanges: task scheduling, worker selection and the
//! automation driver that performs each engagement action.

pub mod driver;
pub mod orchestrator;
pub mod pool;

pub use driver::{
    build_driver, AutomationDriver, DriverError, DryRunAutomationDriver, HttpAutomationDriver,
};
pub use orchestrator::{Orchestrator, OrchestratorDeps, OrchestratorHandle, OrchestratorInbox};
pub use pool::{PoolManager, PoolManagerError};
