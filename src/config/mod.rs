//! Configuration management for the subscription service.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support (`CONFIG_PATH`)
//! - Environment variable overrides (`TBS__SECTION__KEY`)
//! - Section-wise validation
mod delivery;
mod gateway;
mod health;
mod reconcile;
mod server;
mod subscriptions;
mod webhook;
pub use delivery::*;
pub use gateway::*;
pub use health::*;
pub use reconcile::*;
pub use server::*;
pub use subscriptions::*;
pub use webhook::*;


use std::env;
use std::fmt::Debug;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::Result;
use crate::SubscriptionDefaults;

/// Main configuration container.
///
/// Sources, later overriding earlier:
/// 1. Default values from code
/// 2. Configuration file named by `CONFIG_PATH`
/// 3. Environment variables prefixed with `TBS__`
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct TbsConfig {
    /// Inbound webhook surface
    #[serde(default)]
    pub webhook: WebhookConfig,
    /// Remote subscription management
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Remote FHIR server used by the listener binary
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Heartbeat staleness detection
    #[serde(default)]
    pub health: HealthConfig,
    /// Handler failure reporting
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Defaults applied to subscriptions that leave a field unset
    #[serde(default)]
    pub defaults: SubscriptionDefaults,
    /// Declarative subscriptions (used by the listener binary)
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionEntry>,
    /// Listener binary HTTP settings
    #[serde(default)]
    pub server: ServerConfig,
}

impl Debug for TbsConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TbsConfig")
            .field("webhook", &self.webhook)
            .field("reconcile", &self.reconcile)
            .field("gateway", &self.gateway)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl TbsConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// # Note
    /// Validation is deferred so that `with_override_config()` can still be
    /// applied. Callers MUST call `validate()` before use.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("CONFIG_PATH", "config/tbs.toml");
    /// std::env::set_var("TBS__WEBHOOK__TOKEN", "secret");
    /// let cfg = TbsConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(environment());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies another configuration file on top of the current values.
    ///
    /// Environment variables are re-applied afterwards so they keep the
    /// highest priority.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Turns subscription management off when no remote FHIR server is
    /// configured to manage them on.
    ///
    /// For hosts relying on the built-in [`HttpGateway`](crate::HttpGateway);
    /// call before `validate()`.
    pub fn without_unreachable_management(mut self) -> Self {
        if self.reconcile.manage_subscriptions && self.gateway.base_url.is_none() {
            warn!("gateway.base_url is not set, remote subscriptions will not be managed");
            self.reconcile.manage_subscriptions = false;
        }
        self
    }

    /// Validates every section and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.webhook.validate(self.reconcile.manage_subscriptions)?;
        self.reconcile.validate()?;
        self.gateway.validate()?;
        self.health.validate()?;
        self.delivery.validate()?;
        self.server.validate()?;
        for entry in &self.subscriptions {
            entry.validate()?;
        }
        Ok(self)
    }
}

fn environment() -> Environment {
    Environment::with_prefix("TBS")
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}
