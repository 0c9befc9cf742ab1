use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::FhirVersion;
use crate::Result;

/// Remote FHIR server holding the managed subscription records.
#[derive(Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    /// FHIR base URL, e.g. `https://aidbox.example.org/fhir`.
    /// Without it the listener cannot manage subscriptions.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Subscription resource shape spoken by the server
    /// Default: r4b
    #[serde(default)]
    pub fhir_version: FhirVersion,

    /// Basic auth client id
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Per-request timeout (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// `_count` requested per search page
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("fhir_version", &self.fhir_version)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            fhir_version: FhirVersion::default(),
            username: None,
            password: None,
            request_timeout_ms: default_request_timeout_ms(),
            page_size: default_page_size(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = self.base_url.as_deref() {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(ConfigError::Message(format!(
                    "gateway.base_url must be an http(s) URL, got {url}"
                ))));
            }
        }

        if self.password.is_some() && self.username.is_none() {
            return Err(Error::Config(ConfigError::Message(
                "gateway.password is set without gateway.username".into(),
            )));
        }

        if self.request_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "gateway.request_timeout_ms must be greater than 0".into(),
            )));
        }

        if self.page_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "gateway.page_size must be greater than 0".into(),
            )));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_page_size() -> u32 {
    100
}
