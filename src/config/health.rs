use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthConfig {
    /// A subscription is stale after `heartbeat_period * stale_factor`
    /// without a heartbeat or event. Must be at least 2 to absorb jitter.
    #[serde(default = "default_stale_factor")]
    pub stale_factor: u32,

    /// How often staleness is evaluated (milliseconds)
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_factor: default_stale_factor(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stale_factor < 2 {
            return Err(Error::Config(ConfigError::Message(format!(
                "health.stale_factor must be at least 2, got {}",
                self.stale_factor
            ))));
        }

        if self.check_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "health.check_interval_ms must be greater than 0".into(),
            )));
        }

        Ok(())
    }
}

fn default_stale_factor() -> u32 {
    3
}
fn default_check_interval_ms() -> u64 {
    10_000
}
