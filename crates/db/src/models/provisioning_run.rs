use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type, types::Json};
use thiserror::Error;
use ts_rs::TS;

#[derive(Debug, Error)]
pub enum ProvisioningRunError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Provisioning run not found")]
    NotFound,
    #[error("Provisioning run is not in progress")]
    NotInProgress,
}

/// Free-form run options, e.g. `{"include_demo": true, "company_name": "Acme"}`.
pub type RunConfig = BTreeMap<String, Value>;

/// Scratch-pad shared between steps of one run. Unknown keys are kept as-is.
pub type RunMetadata = BTreeMap<String, Value>;

/// Overall state of a tenant's provisioning run
#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "run_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum RunStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Partial,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::NotStarted => write!(f, "NOT_STARTED"),
            RunStatus::InProgress => write!(f, "IN_PROGRESS"),
            RunStatus::Completed => write!(f, "COMPLETED"),
            RunStatus::Failed => write!(f, "FAILED"),
            RunStatus::Partial => write!(f, "PARTIAL"),
        }
    }
}

/// Outcome recorded for a single step. Absence from the run's step map
/// means the step has not been attempted yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum StepStatus {
    Completed,
    Exists,
    Skipped,
    Failed,
}

impl StepStatus {
    /// Completed or found already present; counts toward progress.
    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Exists)
    }

    /// Terminal and not failed: the orchestrator never re-invokes these.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Exists | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Exists => write!(f, "exists"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Failure taxonomy for downstream engine errors
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ErrorKind {
    Duplicate,
    Validation,
    MissingReference,
    Transient,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Duplicate => write!(f, "duplicate"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::MissingReference => write!(f, "missing_reference"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct StepRecord {
    pub status: StepStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Set for transient failures that a later retry/continue may clear.
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    #[ts(type = "number")]
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl StepRecord {
    pub fn skipped(message: impl Into<String>) -> Self {
        StepRecord {
            status: StepStatus::Skipped,
            message: message.into(),
            error: None,
            error_kind: None,
            retryable: false,
            metadata: None,
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(message: impl Into<String>, error: impl Into<String>, kind: ErrorKind) -> Self {
        StepRecord {
            status: StepStatus::Failed,
            message: message.into(),
            error: Some(error.into()),
            error_kind: Some(kind),
            retryable: kind == ErrorKind::Transient,
            metadata: None,
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// One row per tenant
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ProvisioningRun {
    pub tenant_id: String,
    pub status: RunStatus,
    #[sqlx(json)]
    pub steps: BTreeMap<String, StepRecord>,
    #[sqlx(json)]
    pub config: RunConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_step: Option<String>,
    #[sqlx(json)]
    pub metadata: RunMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Bumped on every write; control operations compare-and-set on it.
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields written when a run is flipped into IN_PROGRESS
#[derive(Debug)]
pub struct BeginRun<'a> {
    pub steps: &'a BTreeMap<String, StepRecord>,
    pub config: &'a RunConfig,
    pub correlation_id: &'a str,
    pub started_at: DateTime<Utc>,
}

/// Terminal write at the end of the step loop
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub error_step: Option<String>,
    pub error_message: Option<String>,
}

impl ProvisioningRun {
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.get(name)
    }

    /// Insert a NOT_STARTED row for the tenant if none exists, then load it.
    pub async fn ensure(pool: &SqlitePool, tenant_id: &str) -> Result<Self, ProvisioningRunError> {
        sqlx::query(
            r#"INSERT INTO provisioning_runs (tenant_id)
               VALUES (?1)
               ON CONFLICT(tenant_id) DO NOTHING"#,
        )
        .bind(tenant_id)
        .execute(pool)
        .await?;

        Self::find_by_tenant(pool, tenant_id)
            .await?
            .ok_or(ProvisioningRunError::NotFound)
    }

    pub async fn find_by_tenant(
        pool: &SqlitePool,
        tenant_id: &str,
    ) -> Result<Option<Self>, ProvisioningRunError> {
        let run = sqlx::query_as::<_, ProvisioningRun>(
            r#"SELECT * FROM provisioning_runs WHERE tenant_id = ?1"#,
        )
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;

        Ok(run)
    }

    /// Runs left IN_PROGRESS, e.g. by a process that exited mid-run.
    pub async fn find_in_progress(pool: &SqlitePool) -> Result<Vec<Self>, ProvisioningRunError> {
        let runs = sqlx::query_as::<_, ProvisioningRun>(
            r#"SELECT * FROM provisioning_runs
               WHERE status = 'IN_PROGRESS'
               ORDER BY updated_at"#,
        )
        .fetch_all(pool)
        .await?;

        Ok(runs)
    }

    /// Atomically flip a run into IN_PROGRESS.
    ///
    /// Succeeds only if the row is still at `expected_version` and not already
    /// in progress; `Ok(None)` means another caller won the race.
    pub async fn begin(
        pool: &SqlitePool,
        tenant_id: &str,
        expected_version: i64,
        begin: BeginRun<'_>,
    ) -> Result<Option<Self>, ProvisioningRunError> {
        let run = sqlx::query_as::<_, ProvisioningRun>(
            r#"UPDATE provisioning_runs
               SET status = 'IN_PROGRESS', steps = ?3, config = ?4, correlation_id = ?5,
                   error_message = NULL, error_step = NULL,
                   started_at = ?6, completed_at = NULL,
                   version = version + 1, updated_at = datetime('now', 'subsec')
               WHERE tenant_id = ?1 AND version = ?2 AND status <> 'IN_PROGRESS'
               RETURNING *"#,
        )
        .bind(tenant_id)
        .bind(expected_version)
        .bind(Json(begin.steps))
        .bind(Json(begin.config))
        .bind(begin.correlation_id)
        .bind(begin.started_at)
        .fetch_optional(pool)
        .await?;

        Ok(run)
    }

    /// Persist step records and metadata of a run that is executing.
    pub async fn save_progress(&self, pool: &SqlitePool) -> Result<(), ProvisioningRunError> {
        let result = sqlx::query(
            r#"UPDATE provisioning_runs
               SET steps = ?2, metadata = ?3,
                   version = version + 1, updated_at = datetime('now', 'subsec')
               WHERE tenant_id = ?1 AND status = 'IN_PROGRESS'"#,
        )
        .bind(&self.tenant_id)
        .bind(Json(&self.steps))
        .bind(Json(&self.metadata))
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ProvisioningRunError::NotInProgress);
        }
        Ok(())
    }

    /// Move an executing run to its terminal status.
    pub async fn finish(
        pool: &SqlitePool,
        tenant_id: &str,
        outcome: &RunOutcome,
    ) -> Result<Self, ProvisioningRunError> {
        sqlx::query_as::<_, ProvisioningRun>(
            r#"UPDATE provisioning_runs
               SET status = ?2, error_step = ?3, error_message = ?4, completed_at = ?5,
                   version = version + 1, updated_at = datetime('now', 'subsec')
               WHERE tenant_id = ?1 AND status = 'IN_PROGRESS'
               RETURNING *"#,
        )
        .bind(tenant_id)
        .bind(outcome.status)
        .bind(&outcome.error_step)
        .bind(&outcome.error_message)
        .bind(Utc::now())
        .fetch_optional(pool)
        .await?
        .ok_or(ProvisioningRunError::NotInProgress)
    }

    /// Force an executing run to FAILED, replacing its step map.
    ///
    /// Returns `false` when the run was no longer in progress.
    pub async fn abort(
        pool: &SqlitePool,
        tenant_id: &str,
        steps: &BTreeMap<String, StepRecord>,
        error_step: Option<&str>,
        error_message: &str,
    ) -> Result<bool, ProvisioningRunError> {
        let result = sqlx::query(
            r#"UPDATE provisioning_runs
               SET status = 'FAILED', steps = ?2, error_step = ?3, error_message = ?4,
                   completed_at = ?5,
                   version = version + 1, updated_at = datetime('now', 'subsec')
               WHERE tenant_id = ?1 AND status = 'IN_PROGRESS'"#,
        )
        .bind(tenant_id)
        .bind(Json(steps))
        .bind(error_step)
        .bind(error_message)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Write back a run that is not executing (used by manual step skips).
    ///
    /// Version-checked; `Ok(None)` means the row changed underneath us.
    pub async fn update_idle(&self, pool: &SqlitePool) -> Result<Option<Self>, ProvisioningRunError> {
        let run = sqlx::query_as::<_, ProvisioningRun>(
            r#"UPDATE provisioning_runs
               SET status = ?3, steps = ?4, error_step = ?5, error_message = ?6, completed_at = ?7,
                   version = version + 1, updated_at = datetime('now', 'subsec')
               WHERE tenant_id = ?1 AND version = ?2 AND status <> 'IN_PROGRESS'
               RETURNING *"#,
        )
        .bind(&self.tenant_id)
        .bind(self.version)
        .bind(self.status)
        .bind(Json(&self.steps))
        .bind(&self.error_step)
        .bind(&self.error_message)
        .bind(self.completed_at)
        .fetch_optional(pool)
        .await?;

        Ok(run)
    }
}
