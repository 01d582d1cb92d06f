use std::sync::Arc;

use async_trait::async_trait;
use db::models::provisioning_run::{RunConfig, RunMetadata};
use engine_client::{EngineAdapter, Method};
use serde_json::{Value, json};

use crate::services::provisioning::step::{StepError, StepExecutor, StepOutput};

const LOGGED_USER_PATH: &str = "/api/method/frappe.auth.get_logged_user";

/// Verifies the engine accepts our credentials before anything is created.
pub struct EngineCheck {
    engine: Arc<dyn EngineAdapter>,
}

impl EngineCheck {
    pub fn new(engine: Arc<dyn EngineAdapter>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl StepExecutor for EngineCheck {
    async fn execute(
        &self,
        _tenant_id: &str,
        _config: &RunConfig,
        metadata: &mut RunMetadata,
    ) -> Result<StepOutput, StepError> {
        let response = self
            .engine
            .proxy(Method::GET, LOGGED_USER_PATH, None, None)
            .await?;
        let user = response
            .data
            .as_str()
            .unwrap_or("unknown user")
            .to_string();

        metadata.insert("engine_user".into(), Value::String(user.clone()));
        Ok(StepOutput::completed(format!("Connected to engine as {user}"))
            .with_metadata(json!({ "engine_user": user })))
    }
}
