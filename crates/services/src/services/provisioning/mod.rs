//! Tenant Provisioning Service
//!
//! Drives a tenant through an ordered list of steps against the downstream
//! engine. Runs are persisted per tenant, resumable after failure, and each
//! step is idempotent so repeating a run never duplicates engine resources.
//!
//! ```text
//! start/retry/continue --> runner (spawned, supervised) --> orchestrator loop
//!                                                           |-> health gate
//!                                                           |-> step executor --> engine
//!                                                           '-> error classifier
//! status/logs          --> status reporter (reads the persisted run)
//! ```

pub mod classifier;
pub mod collision;
pub mod config;
pub mod health_gate;
pub mod orchestrator;
pub mod registry;
pub mod runner;
pub mod status;
pub mod step;
pub mod steps;

#[cfg(test)]
pub(crate) mod testing;

use db::models::provisioning_run::ProvisioningRunError;
use thiserror::Error;

pub use config::ProvisioningConfig;
pub use orchestrator::{LaunchedRun, ProvisioningService};
pub use registry::{StepDefinition, StepRegistry};
pub use status::{RunSnapshot, StatusReporter, StepErrorEntry, StepLogEntry};
pub use step::{StepError, StepExecutor, StepOutput, StepResult};

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Run(#[from] ProvisioningRunError),
    #[error("Provisioning for tenant {0} is already in progress")]
    AlreadyRunning(String),
    #[error("No provisioning run found for tenant {0}")]
    RunNotFound(String),
    #[error("Provisioning run for tenant {0} is not in progress")]
    NotInProgress(String),
    #[error("Provisioning run for tenant {0} was modified concurrently")]
    Conflict(String),
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("Unknown provisioning step: {0}")]
    UnknownStep(String),
    #[error("Step {0} is not optional and cannot be skipped")]
    StepNotOptional(String),
    #[error("Step {0} has not failed")]
    StepNotFailed(String),
    #[error("Step {0} already succeeded and cannot be skipped")]
    StepAlreadySucceeded(String),
}
