use std::sync::Arc;

use async_trait::async_trait;
use db::models::provisioning_run::{RunConfig, RunMetadata};
use engine_client::EngineAdapter;
use serde_json::{Value, json};
use tracing::info;

use super::{config_str, find_one};
use crate::services::provisioning::step::{StepError, StepExecutor, StepOutput};

const RESOURCE: &str = "Warehouse";
const DEFAULT_WAREHOUSE_NAME: &str = "Stores";

/// Creates the default stock warehouse under the company from `create_company`.
pub struct CreateWarehouse {
    engine: Arc<dyn EngineAdapter>,
}

impl CreateWarehouse {
    pub fn new(engine: Arc<dyn EngineAdapter>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl StepExecutor for CreateWarehouse {
    async fn execute(
        &self,
        _tenant_id: &str,
        config: &RunConfig,
        metadata: &mut RunMetadata,
    ) -> Result<StepOutput, StepError> {
        let company = metadata
            .get("company_id")
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| StepError::MissingInput("company_id".into()))?;

        let warehouse_name = match config.get("warehouse_name") {
            Some(_) => config_str(config, "warehouse_name").ok_or_else(|| {
                StepError::InvalidConfig("warehouse_name must not be empty".into())
            })?,
            None => DEFAULT_WAREHOUSE_NAME,
        };

        let existing = find_one(
            self.engine.as_ref(),
            RESOURCE,
            json!({ "warehouse_name": warehouse_name, "company": company }),
            &["name"],
        )
        .await?;
        if let Some(row) = existing {
            let id = row.get("name").cloned().unwrap_or(Value::Null);
            metadata.insert("warehouse_id".into(), id.clone());
            return Ok(
                StepOutput::exists(format!("Warehouse {warehouse_name} already exists"))
                    .with_metadata(json!({ "warehouse_id": id })),
            );
        }

        let response = self
            .engine
            .create(
                RESOURCE,
                &json!({ "warehouse_name": warehouse_name, "company": company }),
            )
            .await?;
        let id = response
            .data
            .get("name")
            .cloned()
            .unwrap_or_else(|| json!(warehouse_name));
        info!("Created warehouse {}", id);

        metadata.insert("warehouse_id".into(), id.clone());
        Ok(StepOutput::completed(format!("Created warehouse {warehouse_name}"))
            .with_metadata(json!({ "warehouse_id": id })))
    }
}

#[cfg(test)]
mod tests {
    use db::models::provisioning_run::{ErrorKind, StepStatus};
    use engine_client::EngineResponse;

    use super::*;
    use crate::services::provisioning::{classifier::classify, testing::FakeEngine};

    fn metadata_with_company() -> RunMetadata {
        RunMetadata::from([("company_id".to_string(), json!(42))])
    }

    #[tokio::test]
    async fn missing_company_id_is_a_missing_reference() {
        let engine = FakeEngine::new(|_| Ok(EngineResponse::new(json!([]))));
        let step = CreateWarehouse::new(engine.clone());

        let err = step
            .execute("tenant-a", &RunConfig::new(), &mut RunMetadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::MissingInput(ref key) if key == "company_id"));
        assert_eq!(classify(&err).kind, ErrorKind::MissingReference);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn creates_under_the_company() {
        let engine = FakeEngine::new(|call| match call.op {
            "create" => Ok(EngineResponse::new(json!({"name": "Stores - AC"}))),
            _ => Ok(EngineResponse::new(json!([]))),
        });
        let step = CreateWarehouse::new(engine.clone());
        let mut metadata = metadata_with_company();

        let output = step
            .execute("tenant-a", &RunConfig::new(), &mut metadata)
            .await
            .unwrap();
        assert_eq!(output.status, StepStatus::Completed);
        assert_eq!(metadata.get("warehouse_id"), Some(&json!("Stores - AC")));

        let create = engine.calls().into_iter().find(|c| c.op == "create").unwrap();
        assert_eq!(
            create.body.unwrap(),
            json!({"warehouse_name": "Stores", "company": 42})
        );
    }

    #[tokio::test]
    async fn existing_warehouse_is_not_recreated() {
        let engine = FakeEngine::new(|_| Ok(EngineResponse::new(json!([{"name": "Stores - AC"}]))));
        let step = CreateWarehouse::new(engine.clone());
        let mut metadata = metadata_with_company();

        let output = step
            .execute("tenant-a", &RunConfig::new(), &mut metadata)
            .await
            .unwrap();
        assert_eq!(output.status, StepStatus::Exists);
        assert_eq!(engine.count("create", RESOURCE), 0);
        assert_eq!(metadata.get("warehouse_id"), Some(&json!("Stores - AC")));
    }

    #[tokio::test]
    async fn blank_warehouse_name_is_invalid() {
        let engine = FakeEngine::new(|_| Ok(EngineResponse::new(json!([]))));
        let step = CreateWarehouse::new(engine);
        let config = RunConfig::from([("warehouse_name".to_string(), json!(" "))]);

        let err = step
            .execute("tenant-a", &config, &mut metadata_with_company())
            .await
            .unwrap_err();
        assert_eq!(classify(&err).kind, ErrorKind::Validation);
    }
}
