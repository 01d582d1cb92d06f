//! Background execution of provisioning runs.
//!
//! Every launch gets its own spawned task, instrumented with a span carrying
//! the tenant and correlation id. The task is supervised: an error or panic
//! escaping the orchestrator still leaves the run FAILED, written through a
//! freshly opened database handle if the shared pool is unusable.

use std::{any::Any, future::Future, panic::AssertUnwindSafe};

use db::models::provisioning_run::ProvisioningRun;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use super::{ProvisioningError, orchestrator::ProvisioningService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Start,
    Retry,
    Continue,
}

impl std::fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunTrigger::Start => write!(f, "start"),
            RunTrigger::Retry => write!(f, "retry"),
            RunTrigger::Continue => write!(f, "continue"),
        }
    }
}

pub fn spawn(
    service: ProvisioningService,
    tenant_id: String,
    trigger: RunTrigger,
    correlation_id: String,
) -> JoinHandle<()> {
    let span = info_span!(
        "provisioning_run",
        tenant_id = %tenant_id,
        correlation_id = %correlation_id,
        trigger = %trigger
    );

    tokio::spawn(
        async move {
            let work = service.execute(&tenant_id);
            supervise(&service, &tenant_id, work).await;
        }
        .instrument(span),
    )
}

/// Drive `work` to completion and guarantee a terminal state afterwards.
pub(crate) async fn supervise<F>(service: &ProvisioningService, tenant_id: &str, work: F)
where
    F: Future<Output = Result<ProvisioningRun, ProvisioningError>>,
{
    let failure = match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(run)) => {
            info!(status = %run.status, "Provisioning run finished");
            return;
        }
        Ok(Err(e)) => format!("Provisioning run aborted: {e}"),
        Err(panic) => format!("Provisioning run crashed: {}", panic_message(panic.as_ref())),
    };
    error!("{}", failure);

    match service.fail_run(service.db(), tenant_id, &failure).await {
        Ok(_) => return,
        Err(e) => warn!("Primary database handle unusable ({}), opening a fallback", e),
    }

    match service.db().reconnect().await {
        Ok(fallback) => {
            if let Err(e) = service.fail_run(&fallback, tenant_id, &failure).await {
                error!("Failed to record run failure through the fallback handle: {}", e);
            }
            fallback.pool.close().await;
        }
        Err(e) => error!(
            "Could not open a fallback database handle; run stays IN_PROGRESS until restart: {}",
            e
        ),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
