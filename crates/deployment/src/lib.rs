use anyhow::Error as AnyhowError;
use async_trait::async_trait;
use db::{
    DBService,
    models::provisioning_run::{ProvisioningRun, ProvisioningRunError},
};
use services::services::provisioning::ProvisioningService;
use sqlx::Error as SqlxError;
use thiserror::Error;

/// Message recorded on runs a previous process left IN_PROGRESS.
pub const INTERRUPTED_MESSAGE: &str = "Provisioning interrupted by a server restart";

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    ProvisioningRun(#[from] ProvisioningRunError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[async_trait]
pub trait Deployment: Clone + Send + Sync + 'static {
    async fn new() -> Result<Self, DeploymentError>;

    fn db(&self) -> &DBService;

    fn provisioning(&self) -> &ProvisioningService;

    /// Fail runs left IN_PROGRESS by a previous process, call at startup.
    ///
    /// No task of this process can be driving them yet, so they would
    /// otherwise block every later start for their tenant.
    async fn cleanup_orphan_runs(&self) -> Result<usize, DeploymentError> {
        let orphans = ProvisioningRun::find_in_progress(&self.db().pool).await?;
        let mut cleaned = 0;
        for run in orphans {
            tracing::info!(
                "Found orphaned provisioning run for tenant {} (correlation id {:?})",
                run.tenant_id,
                run.correlation_id
            );
            match self
                .provisioning()
                .fail_run(self.db(), &run.tenant_id, INTERRUPTED_MESSAGE)
                .await
            {
                Ok(true) => {
                    cleaned += 1;
                    tracing::info!("Marked orphaned run for tenant {} as failed", run.tenant_id);
                }
                Ok(false) => {}
                Err(e) => tracing::error!(
                    "Failed to mark orphaned run for tenant {} as failed: {}",
                    run.tenant_id,
                    e
                ),
            }
        }
        Ok(cleaned)
    }
}
