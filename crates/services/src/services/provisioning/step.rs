//! Contract implemented once per provisioning action.

use async_trait::async_trait;
use chrono::Utc;
use db::models::provisioning_run::{ErrorKind, RunConfig, RunMetadata, StepRecord, StepStatus};
use engine_client::EngineError;
use serde_json::Value;
use thiserror::Error;

/// A single provisioning action.
///
/// Implementations must be idempotent: look the target resource up by a
/// deterministic name first and report [`StepOutput::exists`] instead of
/// creating it twice. Values later steps depend on go into `metadata`.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        tenant_id: &str,
        config: &RunConfig,
        metadata: &mut RunMetadata,
    ) -> Result<StepOutput, StepError>;
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// A metadata key an earlier step should have produced is absent.
    #[error("Missing `{0}` from an earlier step")]
    MissingInput(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Successful outcome of a step
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub status: StepStatus,
    pub message: String,
    pub metadata: Option<Value>,
}

impl StepOutput {
    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Completed,
            message: message.into(),
            metadata: None,
        }
    }

    pub fn exists(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Exists,
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// What one execution of a step produced, before it is persisted
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    pub message: String,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub metadata: Option<Value>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn from_output(step_name: &str, output: StepOutput, duration_ms: u64) -> Self {
        Self {
            step_name: step_name.to_string(),
            status: output.status,
            message: output.message,
            error: None,
            error_kind: None,
            metadata: output.metadata,
            duration_ms,
        }
    }

    pub fn failed(
        step_name: &str,
        message: impl Into<String>,
        error: impl Into<String>,
        kind: ErrorKind,
        duration_ms: u64,
    ) -> Self {
        Self {
            step_name: step_name.to_string(),
            status: StepStatus::Failed,
            message: message.into(),
            error: Some(error.into()),
            error_kind: Some(kind),
            metadata: None,
            duration_ms,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn into_record(self) -> StepRecord {
        StepRecord {
            status: self.status,
            message: self.message,
            error: self.error,
            retryable: self.error_kind == Some(ErrorKind::Transient),
            error_kind: self.error_kind,
            metadata: self.metadata,
            duration_ms: self.duration_ms,
            timestamp: Utc::now(),
        }
    }
}
