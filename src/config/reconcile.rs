use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReconcileConfig {
    /// Gates the reconciler. When false webhook routes are still served but
    /// no remote records are created.
    /// Default: true
    #[serde(default = "default_manage_subscriptions")]
    pub manage_subscriptions: bool,

    /// Period of the scheduled full pass (milliseconds)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Random delay added to each scheduled pass (milliseconds)
    #[serde(default)]
    pub jitter_ms: u64,

    /// Use the gateway's update call instead of delete-then-recreate
    /// Default: false
    #[serde(default)]
    pub update_in_place: bool,

    /// Capacity of the trigger queue; extra triggers are coalesced
    #[serde(default = "default_trigger_queue_size")]
    pub trigger_queue_size: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            manage_subscriptions: default_manage_subscriptions(),
            interval_ms: default_interval_ms(),
            jitter_ms: 0,
            update_in_place: false,
            trigger_queue_size: default_trigger_queue_size(),
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "reconcile.interval_ms must be greater than 0".into(),
            )));
        }

        if self.trigger_queue_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "reconcile.trigger_queue_size must be greater than 0".into(),
            )));
        }

        Ok(())
    }
}

fn default_manage_subscriptions() -> bool {
    true
}
fn default_interval_ms() -> u64 {
    60_000
}
fn default_trigger_queue_size() -> usize {
    16
}
