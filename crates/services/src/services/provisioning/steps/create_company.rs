use std::sync::Arc;

use async_trait::async_trait;
use db::models::provisioning_run::{ErrorKind, RunConfig, RunMetadata};
use engine_client::EngineAdapter;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::{config_str, find_one};
use crate::services::provisioning::{
    classifier::classify_engine_error,
    collision::{CandidateSeed, abbreviate, next_candidate},
    step::{StepError, StepExecutor, StepOutput},
};

const RESOURCE: &str = "Company";
const DEFAULT_CURRENCY: &str = "USD";
const MAX_ABBREVIATION_ATTEMPTS: usize = 12;

/// Creates the tenant's company, allocating an abbreviation that is unique
/// engine-wide.
pub struct CreateCompany {
    engine: Arc<dyn EngineAdapter>,
    seed: Option<CandidateSeed>,
}

impl CreateCompany {
    pub fn new(engine: Arc<dyn EngineAdapter>) -> Self {
        Self { engine, seed: None }
    }

    /// Pin the seed for the timestamp/random candidates.
    pub fn with_seed(mut self, seed: CandidateSeed) -> Self {
        self.seed = Some(seed);
        self
    }

    async fn find_company(&self, company_name: &str) -> Result<Option<Value>, StepError> {
        Ok(find_one(
            self.engine.as_ref(),
            RESOURCE,
            json!({ "company_name": company_name }),
            &["name", "abbr"],
        )
        .await?)
    }

    async fn abbreviation_taken(&self, abbr: &str) -> Result<bool, StepError> {
        let row = find_one(
            self.engine.as_ref(),
            RESOURCE,
            json!({ "abbr": abbr }),
            &["name"],
        )
        .await?;
        Ok(row.is_some())
    }
}

fn remember(metadata: &mut RunMetadata, company_id: &Value, abbr: &Value) -> Value {
    metadata.insert("company_id".into(), company_id.clone());
    metadata.insert("company_abbr".into(), abbr.clone());
    json!({ "company_id": company_id, "company_abbr": abbr })
}

#[async_trait]
impl StepExecutor for CreateCompany {
    async fn execute(
        &self,
        tenant_id: &str,
        config: &RunConfig,
        metadata: &mut RunMetadata,
    ) -> Result<StepOutput, StepError> {
        let company_name = config_str(config, "company_name").unwrap_or(tenant_id).to_string();
        if company_name.trim().is_empty() {
            return Err(StepError::InvalidConfig("company_name must not be empty".into()));
        }

        if let Some(existing) = self.find_company(&company_name).await? {
            let id = existing.get("name").cloned().unwrap_or(json!(company_name));
            let abbr = existing.get("abbr").cloned().unwrap_or(Value::Null);
            let recorded = remember(metadata, &id, &abbr);
            return Ok(StepOutput::exists(format!("Company {company_name} already exists"))
                .with_metadata(recorded));
        }

        let base = config_str(config, "company_abbr")
            .map(str::to_string)
            .unwrap_or_else(|| abbreviate(&company_name));
        let seed = self.seed.clone().unwrap_or_else(CandidateSeed::fresh);
        let mut tried = Vec::new();

        for _ in 0..MAX_ABBREVIATION_ATTEMPTS {
            let abbr = next_candidate(&base, &tried, &seed);
            tried.push(abbr.clone());

            if self.abbreviation_taken(&abbr).await? {
                debug!("Abbreviation {} is taken, trying the next candidate", abbr);
                continue;
            }

            let mut body = Map::new();
            body.insert("company_name".into(), json!(company_name));
            body.insert("abbr".into(), json!(abbr));
            body.insert(
                "default_currency".into(),
                json!(config_str(config, "default_currency").unwrap_or(DEFAULT_CURRENCY)),
            );
            if let Some(country) = config_str(config, "country") {
                body.insert("country".into(), json!(country));
            }

            match self.engine.create(RESOURCE, &Value::Object(body)).await {
                Ok(response) => {
                    let id = response.data.get("name").cloned().unwrap_or(json!(company_name));
                    let created_abbr = response.data.get("abbr").cloned().unwrap_or(json!(abbr));
                    info!("Created company {} with abbreviation {}", company_name, abbr);
                    let recorded = remember(metadata, &id, &created_abbr);
                    return Ok(StepOutput::completed(format!("Created company {company_name}"))
                        .with_metadata(recorded));
                }
                Err(e) if classify_engine_error(&e).kind == ErrorKind::Duplicate => {
                    // A concurrent writer may have created the company itself.
                    if let Some(existing) = self.find_company(&company_name).await? {
                        let id = existing.get("name").cloned().unwrap_or(json!(company_name));
                        let abbr = existing.get("abbr").cloned().unwrap_or(Value::Null);
                        let recorded = remember(metadata, &id, &abbr);
                        return Ok(StepOutput::exists(format!(
                            "Company {company_name} already exists"
                        ))
                        .with_metadata(recorded));
                    }
                    warn!("Abbreviation {} collided on create: {}", abbr, e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StepError::Other(anyhow::anyhow!(
            "Exhausted {} abbreviation candidates for company {} (last tried {})",
            MAX_ABBREVIATION_ATTEMPTS,
            company_name,
            tried.last().map(String::as_str).unwrap_or(base.as_str())
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use db::models::provisioning_run::StepStatus;
    use engine_client::{EngineError, EngineResponse};

    use super::*;
    use crate::services::provisioning::{classifier::classify, testing::FakeEngine};

    fn seed() -> CandidateSeed {
        CandidateSeed::new(1_767_225_612, "a1b2c3d4e5f60718")
    }

    fn config() -> RunConfig {
        RunConfig::from([
            ("company_name".to_string(), json!("Acme Corporation")),
            ("country".to_string(), json!("Kenya")),
        ])
    }

    fn filter<'a>(params: &'a Option<Value>, key: &str) -> Option<&'a Value> {
        params.as_ref().and_then(|p| p["filters"].get(key))
    }

    #[tokio::test]
    async fn existing_company_is_reported_as_exists() {
        let engine = FakeEngine::new(|_| {
            Ok(EngineResponse::new(json!([{"name": "Acme Corporation", "abbr": "AC"}])))
        });
        let step = CreateCompany::new(engine.clone());
        let mut metadata = RunMetadata::new();

        let output = step.execute("tenant-a", &config(), &mut metadata).await.unwrap();
        assert_eq!(output.status, StepStatus::Exists);
        assert_eq!(metadata.get("company_id"), Some(&json!("Acme Corporation")));
        assert_eq!(metadata.get("company_abbr"), Some(&json!("AC")));
        assert_eq!(engine.count("create", RESOURCE), 0);
    }

    #[tokio::test]
    async fn taken_abbreviations_walk_the_candidate_sequence() {
        let engine = FakeEngine::new(|call| {
            let taken = ["AC", "AC2", "AC3"];
            match call.op {
                "get" => match filter(&call.params, "abbr").and_then(Value::as_str) {
                    Some(abbr) if taken.contains(&abbr) => {
                        Ok(EngineResponse::new(json!([{"name": "Other Co"}])))
                    }
                    _ => Ok(EngineResponse::new(json!([]))),
                },
                "create" => Ok(EngineResponse::new(json!({
                    "name": "Acme Corporation",
                    "abbr": call.body.as_ref().unwrap()["abbr"],
                }))),
                _ => Err(EngineError::new("HTTPError", "unexpected call")),
            }
        });
        let step = CreateCompany::new(engine.clone()).with_seed(seed());
        let mut metadata = RunMetadata::new();

        let output = step.execute("tenant-a", &config(), &mut metadata).await.unwrap();
        assert_eq!(output.status, StepStatus::Completed);
        assert_eq!(metadata.get("company_abbr"), Some(&json!("AC4")));

        let create = engine.calls().into_iter().find(|c| c.op == "create").unwrap();
        let body = create.body.unwrap();
        assert_eq!(body["country"], json!("Kenya"));
        assert_eq!(body["default_currency"], json!(DEFAULT_CURRENCY));
    }

    #[tokio::test]
    async fn duplicate_on_create_moves_to_next_candidate() {
        let rejected = Mutex::new(vec!["AC".to_string()]);
        let engine = FakeEngine::new(move |call| match call.op {
            "get" => Ok(EngineResponse::new(json!([]))),
            "create" => {
                let abbr = call.body.as_ref().unwrap()["abbr"].as_str().unwrap().to_string();
                if rejected.lock().unwrap().contains(&abbr) {
                    Err(EngineError::new(
                        "DuplicateEntryError",
                        format!("Abbreviation {abbr} already exists"),
                    )
                    .with_status(409))
                } else {
                    Ok(EngineResponse::new(json!({"name": "Acme Corporation", "abbr": abbr})))
                }
            }
            _ => Err(EngineError::new("HTTPError", "unexpected call")),
        });
        let step = CreateCompany::new(engine.clone()).with_seed(seed());
        let mut metadata = RunMetadata::new();

        let output = step.execute("tenant-a", &config(), &mut metadata).await.unwrap();
        assert_eq!(output.status, StepStatus::Completed);
        assert_eq!(metadata.get("company_abbr"), Some(&json!("AC2")));
        assert_eq!(engine.count("create", RESOURCE), 2);
    }

    #[tokio::test]
    async fn exhausted_candidates_fail_as_unknown() {
        let engine = FakeEngine::new(|call| match call.op {
            "get" if filter(&call.params, "abbr").is_some() => {
                Ok(EngineResponse::new(json!([{"name": "Someone Else"}])))
            }
            _ => Ok(EngineResponse::new(json!([]))),
        });
        let step = CreateCompany::new(engine.clone()).with_seed(seed());

        let err = step
            .execute("tenant-a", &config(), &mut RunMetadata::new())
            .await
            .unwrap_err();
        assert_eq!(classify(&err).kind, ErrorKind::Unknown);
        assert_eq!(engine.count("create", RESOURCE), 0);
        // One name lookup plus one check per candidate.
        assert_eq!(engine.count("get", RESOURCE), 1 + MAX_ABBREVIATION_ATTEMPTS);
    }

    #[tokio::test]
    async fn other_engine_errors_propagate() {
        let engine = FakeEngine::new(|call| match call.op {
            "create" => Err(EngineError::new(
                "LinkValidationError",
                "Could not find Country: Kenya",
            )
            .with_status(417)),
            _ => Ok(EngineResponse::new(json!([]))),
        });
        let step = CreateCompany::new(engine.clone()).with_seed(seed());

        let err = step
            .execute("tenant-a", &config(), &mut RunMetadata::new())
            .await
            .unwrap_err();
        assert_eq!(classify(&err).kind, ErrorKind::MissingReference);
        assert_eq!(engine.count("create", RESOURCE), 1);
    }

    #[tokio::test]
    async fn tenant_id_is_the_default_company_name() {
        let engine = FakeEngine::new(|call| match call.op {
            "create" => Ok(EngineResponse::new(json!({"name": "tenant-a"}))),
            _ => Ok(EngineResponse::new(json!([]))),
        });
        let step = CreateCompany::new(engine.clone()).with_seed(seed());
        let mut metadata = RunMetadata::new();

        step.execute("tenant-a", &RunConfig::new(), &mut metadata).await.unwrap();
        let create = engine.calls().into_iter().find(|c| c.op == "create").unwrap();
        let body = create.body.unwrap();
        assert_eq!(body["company_name"], json!("tenant-a"));
        assert_eq!(body["abbr"], json!("TA"));
        assert!(body.get("country").is_none());
        assert_eq!(metadata.get("company_abbr"), Some(&json!("TA")));
    }
}
