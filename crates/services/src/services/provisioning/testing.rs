//! In-memory fakes shared by the provisioning tests.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use db::{
    DBService,
    models::provisioning_run::{
        ProvisioningRun, RunConfig, RunMetadata, RunStatus, StepRecord, StepStatus,
    },
};
use engine_client::{
    EngineAdapter, EngineError, EngineHealthProbe, EngineHealthReport, EngineResponse, Method,
};
use serde_json::Value;

use super::{
    config::ProvisioningConfig,
    orchestrator::{LaunchedRun, ProvisioningService},
    registry::StepRegistry,
    step::{StepError, StepExecutor, StepOutput},
};

type StepFuture = Pin<Box<dyn Future<Output = Result<StepOutput, StepError>> + Send>>;

enum Script {
    Sync(Box<dyn Fn(usize, &mut RunMetadata) -> Result<StepOutput, StepError> + Send + Sync>),
    Async(Box<dyn Fn() -> StepFuture + Send + Sync>),
}

/// Step executor driven by a closure; counts its invocations.
pub(crate) struct ScriptedStep {
    calls: AtomicUsize,
    delay: Option<Duration>,
    script: Script,
}

impl ScriptedStep {
    /// `script` receives the zero-based attempt number.
    pub fn new(
        script: impl Fn(usize, &mut RunMetadata) -> Result<StepOutput, StepError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: None,
            script: Script::Sync(Box::new(script)),
        })
    }

    pub fn async_fn<F, Fut>(script: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutput, StepError>> + Send + 'static,
    {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: None,
            script: Script::Async(Box::new(move || Box::pin(script()))),
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::new(|_, _| Ok(StepOutput::completed("done")))
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
            script: Script::Sync(Box::new(|_, _| Ok(StepOutput::completed("done")))),
        })
    }

    pub fn failing(error: impl Fn() -> StepError + Send + Sync + 'static) -> Arc<Self> {
        Self::new(move |_, _| Err(error()))
    }

    /// Fails the first `times` attempts, then succeeds.
    pub fn fail_first(
        times: usize,
        error: impl Fn() -> StepError + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::new(move |attempt, _| {
            if attempt < times {
                Err(error())
            } else {
                Ok(StepOutput::completed("done"))
            }
        })
    }

    pub fn panicking(message: &'static str) -> Arc<Self> {
        Self::new(move |_, _| panic!("{}", message))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for ScriptedStep {
    async fn execute(
        &self,
        _tenant_id: &str,
        _config: &RunConfig,
        metadata: &mut RunMetadata,
    ) -> Result<StepOutput, StepError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.script {
            Script::Sync(script) => script(attempt, metadata),
            Script::Async(script) => script().await,
        }
    }
}

/// Health probe replaying scripted reports; the last one repeats.
pub(crate) struct FakeProbe {
    reports: Mutex<VecDeque<EngineHealthReport>>,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn sequence(reports: Vec<EngineHealthReport>) -> Self {
        Self {
            reports: Mutex::new(reports.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn online() -> Self {
        Self::sequence(vec![EngineHealthReport::online("Engine is reachable")])
    }

    pub fn offline() -> Self {
        Self::sequence(vec![EngineHealthReport::offline(
            "Engine is not reachable",
            Some("connection refused".into()),
        )])
    }

    pub fn set(&self, report: EngineHealthReport) {
        let mut reports = self.reports.lock().unwrap();
        reports.clear();
        reports.push_back(report);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineHealthProbe for FakeProbe {
    async fn probe(&self, _tenant_id: &str) -> EngineHealthReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut reports = self.reports.lock().unwrap();
        if reports.len() > 1 {
            reports.pop_front().unwrap()
        } else {
            reports
                .front()
                .cloned()
                .unwrap_or_else(|| EngineHealthReport::online("default"))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EngineCall {
    pub op: &'static str,
    pub resource: String,
    pub id: Option<String>,
    pub params: Option<Value>,
    pub body: Option<Value>,
}

type Handler = dyn Fn(&EngineCall) -> Result<EngineResponse, EngineError> + Send + Sync;

/// Engine adapter answering from a closure and recording every call.
pub(crate) struct FakeEngine {
    handler: Box<Handler>,
    calls: Mutex<Vec<EngineCall>>,
}

impl FakeEngine {
    pub fn new(
        handler: impl Fn(&EngineCall) -> Result<EngineResponse, EngineError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str, resource: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.op == op && c.resource == resource)
            .count()
    }

    fn handle(&self, call: EngineCall) -> Result<EngineResponse, EngineError> {
        let result = (self.handler)(&call);
        self.calls.lock().unwrap().push(call);
        result
    }
}

#[async_trait]
impl EngineAdapter for FakeEngine {
    async fn get(
        &self,
        resource_type: &str,
        id: Option<&str>,
        params: Option<&Value>,
    ) -> Result<EngineResponse, EngineError> {
        self.handle(EngineCall {
            op: "get",
            resource: resource_type.to_string(),
            id: id.map(str::to_string),
            params: params.cloned(),
            body: None,
        })
    }

    async fn create(&self, resource_type: &str, data: &Value) -> Result<EngineResponse, EngineError> {
        self.handle(EngineCall {
            op: "create",
            resource: resource_type.to_string(),
            id: None,
            params: None,
            body: Some(data.clone()),
        })
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        data: &Value,
    ) -> Result<EngineResponse, EngineError> {
        self.handle(EngineCall {
            op: "update",
            resource: resource_type.to_string(),
            id: Some(id.to_string()),
            params: None,
            body: Some(data.clone()),
        })
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<EngineResponse, EngineError> {
        self.handle(EngineCall {
            op: "delete",
            resource: resource_type.to_string(),
            id: Some(id.to_string()),
            params: None,
            body: None,
        })
    }

    async fn proxy(
        &self,
        method: Method,
        path: &str,
        params: Option<&Value>,
        body: Option<&Value>,
    ) -> Result<EngineResponse, EngineError> {
        self.handle(EngineCall {
            op: "proxy",
            resource: path.to_string(),
            id: Some(method.to_string()),
            params: params.cloned(),
            body: body.cloned(),
        })
    }
}

pub(crate) fn record(status: StepStatus) -> StepRecord {
    StepRecord {
        status,
        message: status.to_string(),
        error: None,
        error_kind: None,
        retryable: false,
        metadata: None,
        duration_ms: 1,
        timestamp: Utc::now(),
    }
}

/// Detached run value for pure status tests.
pub(crate) fn run_with(status: RunStatus, steps: Vec<(&str, StepRecord)>) -> ProvisioningRun {
    let now = Utc::now();
    ProvisioningRun {
        tenant_id: "tenant-a".to_string(),
        status,
        steps: steps
            .into_iter()
            .map(|(name, record)| (name.to_string(), record))
            .collect(),
        config: RunConfig::new(),
        error_message: None,
        error_step: None,
        metadata: RunMetadata::new(),
        correlation_id: None,
        version: 1,
        started_at: Some(now),
        completed_at: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) async fn service_with(registry: StepRegistry, probe: FakeProbe) -> ProvisioningService {
    let db = DBService::new_in_memory()
        .await
        .expect("Failed to create in-memory database");
    ProvisioningService::new(db, registry, Arc::new(probe), ProvisioningConfig::default())
}

/// Await the background task of a launched run, if any.
pub(crate) async fn wait(launched: LaunchedRun) {
    if let Some(task) = launched.task {
        task.await.expect("provisioning task panicked");
    }
}
