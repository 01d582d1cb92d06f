use std::sync::Arc;

use async_trait::async_trait;
use db::DBService;
use deployment::{Deployment, DeploymentError};
use engine_client::{EngineClientConfig, EngineHealthProbe, HttpEngineClient};
use services::services::provisioning::{
    ProvisioningConfig, ProvisioningService, StepRegistry, steps::default_registry,
};

#[derive(Clone)]
pub struct LocalDeployment {
    db: DBService,
    provisioning: ProvisioningService,
}

impl LocalDeployment {
    /// Assemble a deployment from already-built parts.
    pub fn from_parts(
        db: DBService,
        registry: StepRegistry,
        health: Arc<dyn EngineHealthProbe>,
        config: ProvisioningConfig,
    ) -> Self {
        let provisioning = ProvisioningService::new(db.clone(), registry, health, config);
        Self { db, provisioning }
    }
}

#[async_trait]
impl Deployment for LocalDeployment {
    async fn new() -> Result<Self, DeploymentError> {
        let db = DBService::new().await?;

        let engine_config = EngineClientConfig::from_env();
        let engine = Arc::new(
            HttpEngineClient::new(&engine_config)
                .map_err(|e| anyhow::anyhow!("Failed to build engine client: {e}"))?,
        );
        tracing::info!("Provisioning against engine at {}", engine.base_url());

        let registry = default_registry(engine.clone());
        Ok(Self::from_parts(
            db,
            registry,
            engine,
            ProvisioningConfig::from_env(),
        ))
    }

    fn db(&self) -> &DBService {
        &self.db
    }

    fn provisioning(&self) -> &ProvisioningService {
        &self.provisioning
    }
}
