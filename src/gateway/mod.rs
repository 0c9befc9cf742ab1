//! Remote subscription gateway.
//!
//! The gateway is the only component that talks to the remote server's
//! subscription records. The reconciler drives it; the dispatcher never
//! does. Implementations wrap whatever client the host application uses.

mod criteria;
mod http_gateway;
mod mem_gateway;
pub mod r4b;
pub mod r5;
pub use criteria::*;
pub use http_gateway::*;
pub use mem_gateway::*;

#[cfg(test)]
mod http_gateway_test;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;

use crate::GatewayError;
use crate::PayloadContent;
use crate::Resource;
use crate::Result;
use crate::SubscriptionDefinition;

/// Status of a remote subscription record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Requested,
    Active,
    Error,
    Off,
}

impl SubscriptionStatus {
    /// `requested` and `active` records are expected to deliver.
    pub fn is_live(&self) -> bool {
        matches!(self, SubscriptionStatus::Requested | SubscriptionStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Requested => "requested",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Error => "error",
            SubscriptionStatus::Off => "off",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "requested" => Ok(SubscriptionStatus::Requested),
            "active" => Ok(SubscriptionStatus::Active),
            "error" => Ok(SubscriptionStatus::Error),
            "off" => Ok(SubscriptionStatus::Off),
            other => Err(GatewayError::Decode(format!("unknown subscription status `{other}`"))),
        }
    }
}

/// Everything the remote server needs to create a managed subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub webhook_id: String,
    pub topic: String,
    /// Serialized filters; `None` when the definition declares none
    pub criteria: Option<String>,
    pub channel_endpoint: String,
    pub channel_payload: PayloadContent,
    pub channel_timeout: u32,
    pub channel_heartbeat_period: u32,
    /// Raw `Name: value` headers the remote server sends with every push
    pub channel_headers: Vec<String>,
}

impl SubscriptionSpec {
    pub fn for_definition<C>(
        definition: &SubscriptionDefinition<C>,
        endpoints: &WebhookEndpoints,
        token: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            webhook_id: definition.webhook_id.clone(),
            topic: definition.topic.clone(),
            criteria: build_filter_criteria(&definition.filter_by)?,
            channel_endpoint: endpoints.url_for(&definition.webhook_id),
            channel_payload: definition.payload_content,
            channel_timeout: definition.timeout_seconds,
            channel_heartbeat_period: definition.heartbeat_period_seconds,
            channel_headers: token
                .map(|t| vec![format!("{API_KEY_HEADER}: {t}")])
                .unwrap_or_default(),
        })
    }
}

/// Header carrying the webhook token on every push.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// A subscription record as reported by the remote server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSubscriptionRecord {
    pub remote_id: String,
    pub status: SubscriptionStatus,
    pub topic: String,
    pub criteria: Option<String>,
    pub channel_endpoint: String,
    pub channel_payload: PayloadContent,
    pub channel_timeout: u32,
    pub channel_heartbeat_period: u32,
    pub channel_headers: Vec<String>,
    /// Observation filled in from the health monitor, never by the gateway.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl RemoteSubscriptionRecord {
    pub fn from_spec(
        remote_id: impl Into<String>,
        status: SubscriptionStatus,
        spec: &SubscriptionSpec,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            status,
            topic: spec.topic.clone(),
            criteria: spec.criteria.clone(),
            channel_endpoint: spec.channel_endpoint.clone(),
            channel_payload: spec.channel_payload,
            channel_timeout: spec.channel_timeout,
            channel_heartbeat_period: spec.channel_heartbeat_period,
            channel_headers: spec.channel_headers.clone(),
            last_heartbeat_at: None,
        }
    }

    /// True when every declared field equals the spec. Status is not compared.
    pub fn matches_spec(
        &self,
        spec: &SubscriptionSpec,
    ) -> bool {
        self.topic == spec.topic
            && self.criteria == spec.criteria
            && self.channel_endpoint == spec.channel_endpoint
            && self.channel_payload == spec.channel_payload
            && self.channel_timeout == spec.channel_timeout
            && self.channel_heartbeat_period == spec.channel_heartbeat_period
            && self.channel_headers == spec.channel_headers
    }
}

/// Maps webhook ids to channel endpoints and back.
///
/// The webhook id is the last path segment of the endpoint under
/// `{app_url}/{path_prefix}`; records whose endpoint does not fit this
/// shape are unmanaged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEndpoints {
    base: String,
}

impl WebhookEndpoints {
    pub fn new(
        app_url: &str,
        path_prefix: &str,
    ) -> Self {
        let app_url = app_url.trim_end_matches('/');
        let prefix = path_prefix.trim_matches('/');
        let base = if prefix.is_empty() {
            app_url.to_string()
        } else {
            format!("{app_url}/{prefix}")
        };
        Self { base }
    }

    /// Tag passed to [`SubscriptionGateway::list`].
    pub fn tag(&self) -> &str {
        &self.base
    }

    pub fn url_for(
        &self,
        webhook_id: &str,
    ) -> String {
        format!("{}/{}", self.base, webhook_id)
    }

    pub fn webhook_id_of<'a>(
        &self,
        endpoint: &'a str,
    ) -> Option<&'a str> {
        let rest = endpoint.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
        if rest.is_empty() || rest.contains('/') || rest.contains('?') {
            return None;
        }
        Some(rest)
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SubscriptionGateway: Send + Sync + 'static {
    /// Records whose channel endpoint starts with `tag`. Always fetched fresh.
    async fn list(
        &self,
        tag: &str,
    ) -> Result<Vec<RemoteSubscriptionRecord>>;

    async fn create(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<RemoteSubscriptionRecord>;

    async fn update(
        &self,
        remote_id: &str,
        spec: &SubscriptionSpec,
    ) -> Result<RemoteSubscriptionRecord>;

    async fn delete(
        &self,
        remote_id: &str,
    ) -> Result<()>;

    /// Used by application handlers of `id-only` subscriptions.
    async fn fetch_resource(
        &self,
        reference: &str,
    ) -> Result<Resource>;
}
