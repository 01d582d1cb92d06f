//! Read-only projections of a persisted run: progress snapshot and step log.

use chrono::{DateTime, Utc};
use db::models::provisioning_run::{
    ErrorKind, ProvisioningRun, RunStatus, StepStatus,
};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use super::registry::StepRegistry;

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RunSnapshot {
    pub tenant_id: String,
    pub status: RunStatus,
    pub current_step: Option<String>,
    /// 0..=100
    pub progress: u8,
    pub steps_completed: usize,
    pub total_steps: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_step: Option<String>,
    pub error_message: Option<String>,
    pub errors: Vec<StepErrorEntry>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StepErrorEntry {
    pub step: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StepLogEntry {
    pub step: String,
    pub status: StepStatus,
    pub message: String,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub retryable: bool,
    #[ts(type = "number")]
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Stateless: everything is derived from the run row and the registry.
pub struct StatusReporter;

impl StatusReporter {
    pub fn snapshot(run: &ProvisioningRun, registry: &StepRegistry) -> RunSnapshot {
        let (steps_completed, total_steps) = Self::counts(run, registry);
        let progress = if total_steps == 0 {
            if run.status == RunStatus::Completed { 100 } else { 0 }
        } else {
            ((steps_completed * 100) / total_steps).min(100) as u8
        };

        RunSnapshot {
            tenant_id: run.tenant_id.clone(),
            status: run.status,
            current_step: Self::current_step(run, registry),
            progress,
            steps_completed,
            total_steps,
            started_at: run.started_at,
            completed_at: run.completed_at,
            error_step: run.error_step.clone(),
            error_message: run.error_message.clone(),
            errors: Self::errors(run, registry),
            correlation_id: run.correlation_id.clone(),
        }
    }

    /// `(completed or exists, steps that count)`. Skipped records and
    /// optional steps excluded by config do not count.
    pub fn counts(run: &ProvisioningRun, registry: &StepRegistry) -> (usize, usize) {
        let mut completed = 0;
        let mut total = 0;
        for step in registry.iter() {
            let record = run.step(&step.name);
            if record.is_some_and(|r| r.status == StepStatus::Skipped)
                || registry.is_excluded(step, &run.config)
            {
                continue;
            }
            total += 1;
            if record.is_some_and(|r| r.status.is_success()) {
                completed += 1;
            }
        }
        (completed, total)
    }

    /// First registry step without a terminal record, ignoring excluded ones.
    pub fn current_step(run: &ProvisioningRun, registry: &StepRegistry) -> Option<String> {
        registry
            .iter()
            .filter(|step| !registry.is_excluded(step, &run.config))
            .find(|step| run.step(&step.name).is_none())
            .map(|step| step.name.clone())
    }

    /// Step-level failures in registry order; the run-level message only
    /// when no step carries one.
    pub fn errors(run: &ProvisioningRun, registry: &StepRegistry) -> Vec<StepErrorEntry> {
        let mut errors: Vec<StepErrorEntry> = registry
            .iter()
            .filter_map(|step| {
                let record = run.step(&step.name).filter(|r| r.is_failed())?;
                Some(StepErrorEntry {
                    step: step.name.clone(),
                    error: record.error.clone().unwrap_or_else(|| record.message.clone()),
                })
            })
            .collect();

        if errors.is_empty() {
            if let Some(message) = &run.error_message {
                errors.push(StepErrorEntry {
                    step: run.error_step.clone().unwrap_or_else(|| "run".to_string()),
                    error: message.clone(),
                });
            }
        }
        errors
    }

    pub fn logs(run: &ProvisioningRun, registry: &StepRegistry) -> Vec<StepLogEntry> {
        registry
            .iter()
            .filter_map(|step| {
                let record = run.step(&step.name)?;
                Some(StepLogEntry {
                    step: step.name.clone(),
                    status: record.status,
                    message: record.message.clone(),
                    error: record.error.clone(),
                    error_kind: record.error_kind,
                    retryable: record.retryable,
                    duration_ms: record.duration_ms,
                    completed_at: record.timestamp,
                })
            })
            .collect()
    }
}
