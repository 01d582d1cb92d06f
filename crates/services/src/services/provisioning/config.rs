use std::{env, time::Duration};

pub const DEFAULT_HEALTH_RECHECK: Duration = Duration::from_secs(60);

/// Runtime knobs for the provisioning service
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// A cached engine health verdict older than this is re-probed before
    /// the next gated step.
    pub health_recheck_after: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            health_recheck_after: DEFAULT_HEALTH_RECHECK,
        }
    }
}

impl ProvisioningConfig {
    pub fn from_env() -> Self {
        let health_recheck_after = env::var("PROVISIONING_HEALTH_RECHECK_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HEALTH_RECHECK);

        Self {
            health_recheck_after,
        }
    }
}
