use std::{collections::BTreeMap, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use db::{
    DBService,
    models::provisioning_run::{
        BeginRun, ErrorKind, ProvisioningRun, ProvisioningRunError, RunConfig, RunOutcome,
        RunStatus, StepRecord, StepStatus,
    },
};
use engine_client::{EngineHealthProbe, EngineHealthReport};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ProvisioningError,
    classifier,
    config::ProvisioningConfig,
    health_gate::{EngineHealthGate, HealthVerdict},
    registry::{StepDefinition, StepRegistry},
    runner::{self, RunTrigger, panic_message},
    status::{RunSnapshot, StatusReporter, StepLogEntry},
    step::{StepOutput, StepResult},
};

/// Message on records written for optional steps the run config leaves out.
pub const EXCLUDED_MESSAGE: &str = "Excluded by configuration";
pub const MANUAL_SKIP_MESSAGE: &str = "Skipped manually";

/// What `start` / `retry` / `continue` hand back: the snapshot taken right
/// after the run was flipped to IN_PROGRESS, and the background task.
/// `task` is `None` when there was nothing to run.
#[derive(Debug)]
pub struct LaunchedRun {
    pub snapshot: RunSnapshot,
    pub task: Option<JoinHandle<()>>,
}

/// Tenant provisioning orchestrator
#[derive(Clone)]
pub struct ProvisioningService {
    db: DBService,
    registry: Arc<StepRegistry>,
    health: Arc<dyn EngineHealthProbe>,
    config: ProvisioningConfig,
}

impl ProvisioningService {
    pub fn new(
        db: DBService,
        registry: StepRegistry,
        health: Arc<dyn EngineHealthProbe>,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            db,
            registry: Arc::new(registry),
            health,
            config,
        }
    }

    pub fn db(&self) -> &DBService {
        &self.db
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Begin (or resume) provisioning a tenant.
    ///
    /// Successful step records from earlier attempts are kept, failed ones are
    /// cleared. A COMPLETED run is returned as-is without re-running anything.
    pub async fn start(
        &self,
        tenant_id: &str,
        config: Option<RunConfig>,
        correlation_id: Option<String>,
    ) -> Result<LaunchedRun, ProvisioningError> {
        let run = ProvisioningRun::ensure(&self.db.pool, tenant_id).await?;
        match run.status {
            RunStatus::InProgress => {
                return Err(ProvisioningError::AlreadyRunning(tenant_id.to_string()));
            }
            RunStatus::Completed => {
                info!(tenant_id, "Provisioning already completed, nothing to start");
                return Ok(self.idle(&run));
            }
            _ => {}
        }

        let report = self.health.probe(tenant_id).await;
        if let HealthVerdict::Unhealthy(reason) = HealthVerdict::from_report(&report) {
            warn!(tenant_id, "Refusing to start provisioning: {}", reason);
            return Err(ProvisioningError::EngineUnavailable(reason));
        }

        let config = config.unwrap_or_else(|| run.config.clone());
        // Config exclusions are re-evaluated against the (possibly new) config.
        let steps = run
            .steps
            .iter()
            .filter(|(_, record)| {
                !record.is_failed()
                    && !(record.status == StepStatus::Skipped && record.message == EXCLUDED_MESSAGE)
            })
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect();

        self.launch(run, steps, config, correlation_id, Utc::now(), RunTrigger::Start)
            .await
    }

    /// Clear failed step records and resume. With `step`, only that step's
    /// failure is cleared.
    pub async fn retry(
        &self,
        tenant_id: &str,
        step: Option<&str>,
        correlation_id: Option<String>,
    ) -> Result<LaunchedRun, ProvisioningError> {
        let run = self.resumable(tenant_id).await?;
        if run.status == RunStatus::Completed {
            info!(tenant_id, "Provisioning already completed, nothing to retry");
            return Ok(self.idle(&run));
        }

        let mut steps = run.steps.clone();
        match step {
            Some(name) => {
                if self.registry.get(name).is_none() {
                    return Err(ProvisioningError::UnknownStep(name.to_string()));
                }
                if !steps.get(name).is_some_and(StepRecord::is_failed) {
                    return Err(ProvisioningError::StepNotFailed(name.to_string()));
                }
                steps.remove(name);
            }
            None => steps.retain(|_, record| !record.is_failed()),
        }

        let config = run.config.clone();
        let started_at = run.started_at.unwrap_or_else(Utc::now);
        self.launch(run, steps, config, correlation_id, started_at, RunTrigger::Retry)
            .await
    }

    /// Clear only the first failed step (registry order) and resume.
    pub async fn continue_run(
        &self,
        tenant_id: &str,
        correlation_id: Option<String>,
    ) -> Result<LaunchedRun, ProvisioningError> {
        let run = self.resumable(tenant_id).await?;
        if run.status == RunStatus::Completed {
            info!(tenant_id, "Provisioning already completed, nothing to continue");
            return Ok(self.idle(&run));
        }

        let mut steps = run.steps.clone();
        let first_failed = self
            .registry
            .names()
            .find(|name| steps.get(*name).is_some_and(StepRecord::is_failed))
            .map(str::to_string);
        if let Some(name) = first_failed {
            debug!(tenant_id, step = %name, "Continuing from failed step");
            steps.remove(&name);
        }

        let config = run.config.clone();
        let started_at = run.started_at.unwrap_or_else(Utc::now);
        self.launch(run, steps, config, correlation_id, started_at, RunTrigger::Continue)
            .await
    }

    /// Mark an optional step as skipped. Not allowed while the run executes,
    /// nor once the step has succeeded.
    pub async fn skip_step(
        &self,
        tenant_id: &str,
        step_name: &str,
    ) -> Result<RunSnapshot, ProvisioningError> {
        let step = self
            .registry
            .get(step_name)
            .ok_or_else(|| ProvisioningError::UnknownStep(step_name.to_string()))?;
        if !step.optional {
            return Err(ProvisioningError::StepNotOptional(step_name.to_string()));
        }

        let mut run = ProvisioningRun::ensure(&self.db.pool, tenant_id).await?;
        if run.status == RunStatus::InProgress {
            return Err(ProvisioningError::AlreadyRunning(tenant_id.to_string()));
        }
        if run.step(step_name).is_some_and(|r| r.status.is_success()) {
            return Err(ProvisioningError::StepAlreadySucceeded(step_name.to_string()));
        }

        run.steps
            .insert(step_name.to_string(), StepRecord::skipped(MANUAL_SKIP_MESSAGE));
        self.settle_after_skip(&mut run, step_name);

        let updated = run
            .update_idle(&self.db.pool)
            .await?
            .ok_or_else(|| ProvisioningError::Conflict(tenant_id.to_string()))?;
        info!(tenant_id, step = step_name, status = %updated.status, "Step skipped");

        Ok(StatusReporter::snapshot(&updated, &self.registry))
    }

    pub async fn status(&self, tenant_id: &str) -> Result<RunSnapshot, ProvisioningError> {
        let run = self.load(tenant_id).await?;
        Ok(StatusReporter::snapshot(&run, &self.registry))
    }

    pub async fn logs(&self, tenant_id: &str) -> Result<Vec<StepLogEntry>, ProvisioningError> {
        let run = self.load(tenant_id).await?;
        Ok(StatusReporter::logs(&run, &self.registry))
    }

    pub async fn engine_health(&self, tenant_id: &str) -> EngineHealthReport {
        self.health.probe(tenant_id).await
    }

    /// Walk the registry for an IN_PROGRESS run. Runs inside the background
    /// task; every step outcome is persisted before the next step starts.
    pub async fn execute(&self, tenant_id: &str) -> Result<ProvisioningRun, ProvisioningError> {
        let pool = &self.db.pool;
        let mut run = self.load(tenant_id).await?;
        if run.status != RunStatus::InProgress {
            return Err(ProvisioningError::NotInProgress(tenant_id.to_string()));
        }

        let mut gate = EngineHealthGate::new(self.health.clone(), self.config.health_recheck_after);
        let mut failures: Vec<String> = Vec::new();

        for step in self.registry.iter() {
            if self.registry.is_excluded(step, &run.config) {
                if !run.step(&step.name).is_some_and(|r| r.status == StepStatus::Skipped) {
                    debug!(step = %step.name, "Step excluded by configuration");
                    run.steps
                        .insert(step.name.clone(), StepRecord::skipped(EXCLUDED_MESSAGE));
                    run.save_progress(pool).await?;
                }
                continue;
            }

            if let Some(existing) = run.step(&step.name) {
                if existing.status.is_settled() {
                    debug!(step = %step.name, status = %existing.status, "Step already done, not re-running");
                    continue;
                }

                // A failure that was not cleared for this pass still counts.
                let kind = existing.error_kind.unwrap_or(ErrorKind::Unknown);
                if classifier::is_critical(kind, step.critical) {
                    let error = existing
                        .error
                        .clone()
                        .unwrap_or_else(|| existing.message.clone());
                    return self.halt(tenant_id, &step.name, error).await;
                }
                failures.push(step.name.clone());
                continue;
            }

            let result = self.run_step(step, tenant_id, &mut run, &mut gate).await;
            let failure = result
                .is_failed()
                .then(|| (result.error_kind, result.error.clone()));
            if failure.is_some() {
                warn!(
                    step = %step.name,
                    duration_ms = result.duration_ms,
                    "Step failed: {}",
                    result.error.as_deref().unwrap_or_default()
                );
            } else {
                info!(
                    step = %step.name,
                    status = %result.status,
                    duration_ms = result.duration_ms,
                    "{}",
                    result.message
                );
            }

            run.steps.insert(step.name.clone(), result.into_record());
            run.save_progress(pool).await?;

            if let Some((kind, error)) = failure {
                let kind = kind.unwrap_or(ErrorKind::Unknown);
                if classifier::is_critical(kind, step.critical) {
                    return self
                        .halt(tenant_id, &step.name, error.unwrap_or_default())
                        .await;
                }
                failures.push(step.name.clone());
            }
        }

        let outcome = if failures.is_empty() {
            RunOutcome {
                status: RunStatus::Completed,
                error_step: None,
                error_message: None,
            }
        } else {
            RunOutcome {
                status: RunStatus::Partial,
                error_step: None,
                error_message: Some(format!(
                    "{} non-critical step(s) failed: {}",
                    failures.len(),
                    failures.join(", ")
                )),
            }
        };

        Ok(ProvisioningRun::finish(pool, tenant_id, &outcome).await?)
    }

    /// Force an IN_PROGRESS run to FAILED, charging the failure to the step
    /// it was on. Returns `false` if the run was not in progress.
    pub async fn fail_run(
        &self,
        db: &DBService,
        tenant_id: &str,
        message: &str,
    ) -> Result<bool, ProvisioningRunError> {
        let Some(run) = ProvisioningRun::find_by_tenant(&db.pool, tenant_id).await? else {
            return Ok(false);
        };
        if run.status != RunStatus::InProgress {
            return Ok(false);
        }

        let charged = StatusReporter::current_step(&run, &self.registry)
            .or_else(|| self.last_recorded_step(&run));
        let mut steps = run.steps;
        if let Some(step) = &charged {
            steps.insert(
                step.clone(),
                StepRecord::failed("Step interrupted", message, ErrorKind::Unknown),
            );
        }

        ProvisioningRun::abort(&db.pool, tenant_id, &steps, charged.as_deref(), message).await
    }

    /// Every enabled step has a record; the run died before `finish`. The
    /// last step that actually ran takes the blame.
    fn last_recorded_step(&self, run: &ProvisioningRun) -> Option<String> {
        self.registry
            .iter()
            .rev()
            .filter(|step| !self.registry.is_excluded(step, &run.config))
            .find(|step| {
                run.step(&step.name)
                    .is_some_and(|r| r.status != StepStatus::Skipped)
            })
            .or_else(|| self.registry.iter().rev().find(|step| run.step(&step.name).is_some()))
            .map(|step| step.name.clone())
    }

    async fn run_step(
        &self,
        step: &StepDefinition,
        tenant_id: &str,
        run: &mut ProvisioningRun,
        gate: &mut EngineHealthGate,
    ) -> StepResult {
        let started = Instant::now();

        if step.requires_healthy_engine {
            if let HealthVerdict::Unhealthy(reason) = gate.check(tenant_id).await {
                return StepResult::failed(
                    &step.name,
                    "Engine health check failed",
                    reason,
                    ErrorKind::Transient,
                    elapsed_ms(started),
                );
            }
        }

        let outcome = AssertUnwindSafe(step.executor.execute(
            tenant_id,
            &run.config,
            &mut run.metadata,
        ))
        .catch_unwind()
        .await;
        let duration_ms = elapsed_ms(started);

        match outcome {
            Ok(Ok(output)) => StepResult::from_output(&step.name, output, duration_ms),
            Ok(Err(err)) => {
                let classification = classifier::classify(&err);
                if classification.kind == ErrorKind::Duplicate {
                    StepResult::from_output(
                        &step.name,
                        StepOutput::exists(classification.message),
                        duration_ms,
                    )
                } else {
                    StepResult::failed(
                        &step.name,
                        format!("Step {} failed ({})", step.name, classification.kind),
                        classification.message,
                        classification.kind,
                        duration_ms,
                    )
                }
            }
            Err(panic) => StepResult::failed(
                &step.name,
                format!("Step {} crashed", step.name),
                format!("Step panicked: {}", panic_message(panic.as_ref())),
                ErrorKind::Unknown,
                duration_ms,
            ),
        }
    }

    async fn halt(
        &self,
        tenant_id: &str,
        step_name: &str,
        error: String,
    ) -> Result<ProvisioningRun, ProvisioningError> {
        warn!(step = step_name, "Critical step failed, halting run: {}", error);
        let outcome = RunOutcome {
            status: RunStatus::Failed,
            error_step: Some(step_name.to_string()),
            error_message: Some(error),
        };
        Ok(ProvisioningRun::finish(&self.db.pool, tenant_id, &outcome).await?)
    }

    async fn launch(
        &self,
        run: ProvisioningRun,
        steps: BTreeMap<String, StepRecord>,
        config: RunConfig,
        correlation_id: Option<String>,
        started_at: DateTime<Utc>,
        trigger: RunTrigger,
    ) -> Result<LaunchedRun, ProvisioningError> {
        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let begin = BeginRun {
            steps: &steps,
            config: &config,
            correlation_id: &correlation_id,
            started_at,
        };

        let Some(begun) =
            ProvisioningRun::begin(&self.db.pool, &run.tenant_id, run.version, begin).await?
        else {
            return Err(self.lost_race(&run.tenant_id).await);
        };

        info!(
            tenant_id = %begun.tenant_id,
            %correlation_id,
            %trigger,
            "Provisioning run launched"
        );
        let snapshot = StatusReporter::snapshot(&begun, &self.registry);
        let task = runner::spawn(self.clone(), begun.tenant_id, trigger, correlation_id);

        Ok(LaunchedRun {
            snapshot,
            task: Some(task),
        })
    }

    /// Someone else changed the row between our read and the flip.
    async fn lost_race(&self, tenant_id: &str) -> ProvisioningError {
        match ProvisioningRun::find_by_tenant(&self.db.pool, tenant_id).await {
            Ok(Some(run)) if run.status != RunStatus::InProgress => {
                ProvisioningError::Conflict(tenant_id.to_string())
            }
            _ => ProvisioningError::AlreadyRunning(tenant_id.to_string()),
        }
    }

    fn settle_after_skip(&self, run: &mut ProvisioningRun, skipped: &str) {
        if run.status == RunStatus::NotStarted {
            return;
        }

        let first_failure = self.registry.iter().find_map(|step| {
            run.step(&step.name).filter(|r| r.is_failed()).map(|r| {
                let error = r.error.clone().unwrap_or_else(|| r.message.clone());
                (step.name.clone(), error)
            })
        });

        match first_failure {
            Some((step, error)) => {
                if run.error_step.as_deref() == Some(skipped) {
                    run.error_step = Some(step);
                    run.error_message = Some(error);
                }
            }
            None => {
                let all_terminal = self.registry.iter().all(|step| {
                    self.registry.is_excluded(step, &run.config) || run.step(&step.name).is_some()
                });
                run.error_step = None;
                run.error_message = None;
                if all_terminal {
                    if run.status != RunStatus::Completed {
                        run.completed_at = Some(Utc::now());
                    }
                    run.status = RunStatus::Completed;
                } else {
                    // Halted earlier; nothing failed any more, remaining steps
                    // run on the next start.
                    run.status = RunStatus::NotStarted;
                    run.completed_at = None;
                }
            }
        }
    }

    async fn load(&self, tenant_id: &str) -> Result<ProvisioningRun, ProvisioningError> {
        ProvisioningRun::find_by_tenant(&self.db.pool, tenant_id)
            .await?
            .ok_or_else(|| ProvisioningError::RunNotFound(tenant_id.to_string()))
    }

    async fn resumable(&self, tenant_id: &str) -> Result<ProvisioningRun, ProvisioningError> {
        let run = self.load(tenant_id).await?;
        if run.status == RunStatus::InProgress {
            return Err(ProvisioningError::AlreadyRunning(tenant_id.to_string()));
        }
        Ok(run)
    }

    fn idle(&self, run: &ProvisioningRun) -> LaunchedRun {
        LaunchedRun {
            snapshot: StatusReporter::snapshot(run, &self.registry),
            task: None,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}
