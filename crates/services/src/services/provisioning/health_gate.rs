use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use engine_client::{EngineHealthProbe, EngineHealthReport, EngineHealthStatus};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Unhealthy(String),
}

impl HealthVerdict {
    /// Degraded engines still answer requests, so only `offline` blocks.
    pub fn from_report(report: &EngineHealthReport) -> Self {
        match report.status {
            EngineHealthStatus::Online => HealthVerdict::Healthy,
            EngineHealthStatus::Degraded => {
                warn!(
                    "Engine degraded, continuing: {} {}",
                    report.message,
                    report.error.as_deref().unwrap_or_default()
                );
                HealthVerdict::Healthy
            }
            EngineHealthStatus::Offline => {
                let reason = match &report.error {
                    Some(error) => format!("{}: {}", report.message, error),
                    None => report.message.clone(),
                };
                HealthVerdict::Unhealthy(reason)
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthVerdict::Healthy)
    }
}

/// Per-run engine health check in front of gated steps.
///
/// The first gated step probes the engine; later ones reuse that verdict
/// until it is older than `recheck_after`.
pub struct EngineHealthGate {
    probe: Arc<dyn EngineHealthProbe>,
    recheck_after: Duration,
    last: Option<(Instant, HealthVerdict)>,
}

impl EngineHealthGate {
    pub fn new(probe: Arc<dyn EngineHealthProbe>, recheck_after: Duration) -> Self {
        Self {
            probe,
            recheck_after,
            last: None,
        }
    }

    pub async fn check(&mut self, tenant_id: &str) -> HealthVerdict {
        if let Some((checked_at, verdict)) = &self.last {
            if checked_at.elapsed() < self.recheck_after {
                return verdict.clone();
            }
            debug!(tenant_id, "Cached engine health expired, probing again");
        }

        let report = self.probe.probe(tenant_id).await;
        let verdict = HealthVerdict::from_report(&report);
        self.last = Some((Instant::now(), verdict.clone()));
        verdict
    }
}
