//! Built-in step executors and the default registry.
//!
//! Each step talks to the engine only through [`EngineAdapter`] and looks its
//! target up by a deterministic name before creating anything.

mod create_company;
mod create_warehouse;
mod engine_check;
mod seed_demo_items;

use std::sync::Arc;

use db::models::provisioning_run::RunConfig;
use engine_client::{EngineAdapter, EngineError};
use serde_json::{Value, json};

pub use create_company::CreateCompany;
pub use create_warehouse::CreateWarehouse;
pub use engine_check::EngineCheck;
pub use seed_demo_items::{DEMO_ITEMS, SeedDemoItems};

use super::registry::{StepDefinition, StepRegistry};

pub const INCLUDE_DEMO_KEY: &str = "include_demo";

pub fn default_registry(engine: Arc<dyn EngineAdapter>) -> StepRegistry {
    StepRegistry::new(vec![
        StepDefinition::new("engine_check", Arc::new(EngineCheck::new(engine.clone())))
            .critical()
            .requires_healthy_engine(),
        StepDefinition::new("create_company", Arc::new(CreateCompany::new(engine.clone())))
            .critical()
            .requires_healthy_engine(),
        StepDefinition::new("create_warehouse", Arc::new(CreateWarehouse::new(engine.clone())))
            .critical()
            .requires_healthy_engine(),
        StepDefinition::new("seed_demo_items", Arc::new(SeedDemoItems::new(engine)))
            .included_by(INCLUDE_DEMO_KEY, false),
    ])
}

/// Non-blank string value from the run config.
fn config_str<'a>(config: &'a RunConfig, key: &str) -> Option<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// First document of `resource_type` matching `filters`.
async fn find_one(
    engine: &dyn EngineAdapter,
    resource_type: &str,
    filters: Value,
    fields: &[&str],
) -> Result<Option<Value>, EngineError> {
    let params = json!({
        "filters": filters,
        "fields": fields,
        "limit_page_length": 1,
    });
    let response = engine.get(resource_type, None, Some(&params)).await?;
    Ok(response.first().cloned())
}
