//! FHIR REST gateway.
//!
//! Talks to the remote server's `Subscription` endpoint over HTTP. Managed
//! records are found with a `url:below` search on the webhook tag, the same
//! channel endpoint the records were created with.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::Method;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use super::r4b;
use super::r5;
use super::RemoteSubscriptionRecord;
use super::SubscriptionGateway;
use super::SubscriptionSpec;
use crate::GatewayConfig;
use crate::GatewayError;
use crate::Resource;
use crate::Result;

const FHIR_JSON: &str = "application/fhir+json";

/// Subscription resource flavour spoken by the remote server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FhirVersion {
    /// Subscriptions Backport on R4B
    #[default]
    R4b,
    R5,
}

impl FhirVersion {
    pub fn encode(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<Value> {
        match self {
            FhirVersion::R4b => Ok(r4b::to_subscription(spec)),
            FhirVersion::R5 => r5::to_subscription(spec),
        }
    }

    pub fn decode(
        &self,
        resource: &Value,
    ) -> Result<RemoteSubscriptionRecord> {
        match self {
            FhirVersion::R4b => r4b::from_subscription(resource),
            FhirVersion::R5 => r5::from_subscription(resource),
        }
    }

    /// Field holding the channel endpoint.
    fn endpoint_of<'a>(
        &self,
        resource: &'a Value,
    ) -> Option<&'a str> {
        let endpoint = match self {
            FhirVersion::R4b => resource.get("channel")?.get("endpoint")?,
            FhirVersion::R5 => resource.get("endpoint")?,
        };
        endpoint.as_str()
    }
}

/// [`SubscriptionGateway`] backed by a FHIR server's REST API.
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    version: FhirVersion,
    credentials: Option<(String, Option<String>)>,
    timeout: Duration,
    page_size: u32,
}

impl HttpGateway {
    /// Build a gateway from the `[gateway]` section.
    ///
    /// # Errors
    /// [`GatewayError::Unavailable`] when `base_url` is unset or the HTTP
    /// client cannot be constructed.
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| GatewayError::Unavailable("gateway.base_url is not configured".into()))?
            .trim_end_matches('/')
            .to_string();
        let timeout = config.request_timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            version: config.fhir_version,
            credentials: config.username.clone().map(|u| (u, config.password.clone())),
            timeout,
            page_size: config.page_size,
        })
    }

    fn request(
        &self,
        method: Method,
        url: &str,
    ) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, FHIR_JSON);
        if let Some((username, password)) = &self.credentials {
            req = req.basic_auth(username, password.as_deref());
        }
        req
    }

    async fn send(
        &self,
        req: RequestBuilder,
        subject: &str,
    ) -> Result<Response> {
        let response = req.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!(%status, subject, "remote server refused request: {}", body);
        Err(match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => GatewayError::NotFound(subject.to_string()),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                GatewayError::Unavailable(format!("{status}: {body}"))
            }
            s if s.is_server_error() => GatewayError::Unavailable(format!("{status}: {body}")),
            _ => GatewayError::Rejected(format!("{status}: {body}")),
        }
        .into())
    }

    async fn json(
        &self,
        req: RequestBuilder,
        subject: &str,
    ) -> Result<Value> {
        self.send(req, subject)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::Decode(format!("invalid response body for {subject}: {e}")).into())
    }

    fn transport_error(
        &self,
        e: reqwest::Error,
    ) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Unavailable(e.to_string())
        }
    }

    fn subscription_url(
        &self,
        remote_id: &str,
    ) -> String {
        format!("{}/Subscription/{}", self.base_url, remote_id)
    }

    async fn write(
        &self,
        method: Method,
        url: String,
        resource: &Value,
        subject: &str,
    ) -> Result<RemoteSubscriptionRecord> {
        let req = self
            .request(method, &url)
            .header(reqwest::header::CONTENT_TYPE, FHIR_JSON)
            .header("Prefer", "return=representation")
            .json(resource);
        let stored = self.json(req, subject).await?;
        self.version.decode(&stored)
    }
}

#[async_trait]
impl SubscriptionGateway for HttpGateway {
    async fn list(
        &self,
        tag: &str,
    ) -> Result<Vec<RemoteSubscriptionRecord>> {
        let mut records = Vec::new();
        let mut next = Some(self.request(Method::GET, &format!("{}/Subscription", self.base_url)).query(&[
            ("url:below", tag.to_string()),
            ("_count", self.page_size.to_string()),
        ]));

        while let Some(req) = next.take() {
            let bundle = self.json(req, "Subscription").await?;

            for resource in bundle_resources(&bundle) {
                // Servers without `:below` support may return everything
                if !self.version.endpoint_of(resource).is_some_and(|e| e.starts_with(tag)) {
                    continue;
                }
                match self.version.decode(resource) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(
                        id = ?resource.get("id"),
                        "skipping undecodable subscription: {}",
                        e
                    ),
                }
            }

            next = next_link(&bundle).map(|url| self.request(Method::GET, url));
        }

        Ok(records)
    }

    async fn create(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<RemoteSubscriptionRecord> {
        let resource = self.version.encode(spec)?;
        self.write(Method::POST, format!("{}/Subscription", self.base_url), &resource, &spec.webhook_id)
            .await
    }

    async fn update(
        &self,
        remote_id: &str,
        spec: &SubscriptionSpec,
    ) -> Result<RemoteSubscriptionRecord> {
        let mut resource = self.version.encode(spec)?;
        resource["id"] = Value::String(remote_id.to_string());
        self.write(Method::PUT, self.subscription_url(remote_id), &resource, remote_id)
            .await
    }

    async fn delete(
        &self,
        remote_id: &str,
    ) -> Result<()> {
        let req = self.request(Method::DELETE, &self.subscription_url(remote_id));
        self.send(req, remote_id).await?;
        Ok(())
    }

    async fn fetch_resource(
        &self,
        reference: &str,
    ) -> Result<Resource> {
        let req = self.request(Method::GET, &format!("{}/{}", self.base_url, reference));
        self.json(req, reference).await
    }
}

fn bundle_resources(bundle: &Value) -> impl Iterator<Item = &Value> {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("resource"))
}

fn next_link(bundle: &Value) -> Option<&str> {
    bundle
        .get("link")?
        .as_array()?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))?
        .get("url")?
        .as_str()
}
