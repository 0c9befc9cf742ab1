use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Keep a bounded log of delivery failures for inspection.
    /// Redelivery policy is not implemented; failures are only recorded.
    /// Default: false (failures are logged)
    #[serde(default)]
    pub handle_delivery_errors: bool,

    /// Entries kept by the failure log before the oldest are dropped
    #[serde(default = "default_failure_log_capacity")]
    pub failure_log_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            handle_delivery_errors: false,
            failure_log_capacity: default_failure_log_capacity(),
        }
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.handle_delivery_errors && self.failure_log_capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "delivery.failure_log_capacity must be greater than 0".into(),
            )));
        }
        Ok(())
    }
}

fn default_failure_log_capacity() -> usize {
    1024
}
