use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Serialize, Deserialize, Clone)]
pub struct WebhookConfig {
    /// Base URL the remote server uses to reach this application.
    /// Required when subscriptions are managed.
    #[serde(default)]
    pub app_url: Option<String>,

    /// Path prefix under which one route per webhook id is installed
    /// Default: "webhook"
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Shared token expected in the `X-Api-Key` header. No check when unset.
    #[serde(default)]
    pub token: Option<String>,

    /// Largest accepted notification body
    /// Default: 4 MiB
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    /// How long in-flight handlers may run after shutdown begins
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("app_url", &self.app_url)
            .field("path_prefix", &self.path_prefix)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("max_body_bytes", &self.max_body_bytes)
            .field("drain_timeout_ms", &self.drain_timeout_ms)
            .finish()
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            app_url: None,
            path_prefix: default_path_prefix(),
            token: None,
            max_body_bytes: default_max_body_bytes(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl WebhookConfig {
    pub fn validate(
        &self,
        manage_subscriptions: bool,
    ) -> Result<()> {
        match self.app_url.as_deref() {
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                return Err(Error::Config(ConfigError::Message(format!(
                    "webhook.app_url must be an http(s) URL, got {url}"
                ))));
            }
            None if manage_subscriptions => {
                return Err(Error::Config(ConfigError::Message(
                    "webhook.app_url is required when reconcile.manage_subscriptions is enabled".into(),
                )));
            }
            _ => {}
        }

        if self.path_prefix.contains('?') || self.path_prefix.contains('#') {
            return Err(Error::Config(ConfigError::Message(format!(
                "webhook.path_prefix contains query characters: {}",
                self.path_prefix
            ))));
        }

        if matches!(self.token.as_deref(), Some(t) if t.trim().is_empty()) {
            return Err(Error::Config(ConfigError::Message(
                "webhook.token must not be empty when set".into(),
            )));
        }

        if self.max_body_bytes == 0 {
            return Err(Error::Config(ConfigError::Message(
                "webhook.max_body_bytes must be greater than 0".into(),
            )));
        }

        Ok(())
    }

    /// Prefix path segments, without surrounding slashes.
    pub fn prefix_segments(&self) -> Vec<String> {
        self.path_prefix
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn default_path_prefix() -> String {
    "webhook".to_string()
}
fn default_max_body_bytes() -> u64 {
    4 * 1024 * 1024
}
fn default_drain_timeout_ms() -> u64 {
    5_000
}
