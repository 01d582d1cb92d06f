use std::{collections::HashSet, sync::Arc};

use db::models::provisioning_run::RunConfig;
use serde_json::Value;

use super::step::StepExecutor;

/// Config key holding an array of optional step names to leave out.
pub const SKIP_STEPS_KEY: &str = "skip_steps";

/// Boolean config flag that switches an optional step on or off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncludeFlag {
    pub key: &'static str,
    pub default: bool,
}

/// One entry of the ordered step list
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub executor: Arc<dyn StepExecutor>,
    /// Validation or transient failures halt the run.
    pub critical: bool,
    /// May be excluded by config or skipped manually.
    pub optional: bool,
    pub requires_healthy_engine: bool,
    pub include_flag: Option<IncludeFlag>,
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("critical", &self.critical)
            .field("optional", &self.optional)
            .field("requires_healthy_engine", &self.requires_healthy_engine)
            .field("include_flag", &self.include_flag)
            .finish()
    }
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            name: name.into(),
            executor,
            critical: false,
            optional: false,
            requires_healthy_engine: false,
            include_flag: None,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn requires_healthy_engine(mut self) -> Self {
        self.requires_healthy_engine = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Optional step controlled by a boolean config flag.
    pub fn included_by(mut self, key: &'static str, default: bool) -> Self {
        self.optional = true;
        self.include_flag = Some(IncludeFlag { key, default });
        self
    }
}

/// Fixed, ordered list of provisioning steps
#[derive(Debug, Clone)]
pub struct StepRegistry {
    steps: Vec<StepDefinition>,
}

impl StepRegistry {
    pub fn new(steps: Vec<StepDefinition>) -> Self {
        debug_assert!(
            {
                let mut seen = HashSet::new();
                steps.iter().all(|s| seen.insert(s.name.as_str()))
            },
            "step names must be unique"
        );
        Self { steps }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &StepDefinition> {
        self.steps.iter()
    }

    pub fn get(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    /// Whether `config` leaves this step out of the run. Required steps are
    /// never excluded.
    pub fn is_excluded(&self, step: &StepDefinition, config: &RunConfig) -> bool {
        if !step.optional {
            return false;
        }

        let listed = config
            .get(SKIP_STEPS_KEY)
            .and_then(Value::as_array)
            .is_some_and(|names| names.iter().any(|n| n.as_str() == Some(step.name.as_str())));
        if listed {
            return true;
        }

        match step.include_flag {
            Some(flag) => !config
                .get(flag.key)
                .and_then(Value::as_bool)
                .unwrap_or(flag.default),
            None => false,
        }
    }
}
