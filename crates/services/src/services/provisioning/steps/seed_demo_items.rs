use std::sync::Arc;

use async_trait::async_trait;
use db::models::provisioning_run::{ErrorKind, RunConfig, RunMetadata};
use engine_client::EngineAdapter;
use serde_json::json;
use tracing::debug;

use super::find_one;
use crate::services::provisioning::{
    classifier::classify_engine_error,
    step::{StepError, StepExecutor, StepOutput},
};

const RESOURCE: &str = "Item";

/// `(item_code, item_name, item_group)`
pub const DEMO_ITEMS: &[(&str, &str, &str)] = &[
    ("DEMO-001", "Demo Coffee Beans 1kg", "Products"),
    ("DEMO-002", "Demo Paper Cups (50)", "Consumable"),
    ("DEMO-003", "Demo Consulting Hour", "Services"),
];

/// Optional sample catalogue for trial tenants.
pub struct SeedDemoItems {
    engine: Arc<dyn EngineAdapter>,
}

impl SeedDemoItems {
    pub fn new(engine: Arc<dyn EngineAdapter>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl StepExecutor for SeedDemoItems {
    async fn execute(
        &self,
        _tenant_id: &str,
        _config: &RunConfig,
        metadata: &mut RunMetadata,
    ) -> Result<StepOutput, StepError> {
        let mut created = 0;

        for (code, name, group) in DEMO_ITEMS {
            let existing = find_one(
                self.engine.as_ref(),
                RESOURCE,
                json!({ "item_code": code }),
                &["name"],
            )
            .await?;
            if existing.is_some() {
                continue;
            }

            let body = json!({
                "item_code": code,
                "item_name": name,
                "item_group": group,
                "stock_uom": "Nos",
                "is_stock_item": if *group == "Services" { 0 } else { 1 },
            });
            match self.engine.create(RESOURCE, &body).await {
                Ok(_) => created += 1,
                Err(e) if classify_engine_error(&e).kind == ErrorKind::Duplicate => {
                    debug!("Demo item {} appeared concurrently", code);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let codes: Vec<&str> = DEMO_ITEMS.iter().map(|(code, _, _)| *code).collect();
        metadata.insert("demo_items".into(), json!(codes));

        let output = if created == 0 {
            StepOutput::exists("Demo items already present")
        } else {
            StepOutput::completed(format!(
                "Seeded {created} of {} demo items",
                DEMO_ITEMS.len()
            ))
        };
        Ok(output.with_metadata(json!({ "created": created })))
    }
}
