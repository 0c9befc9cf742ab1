//! Declared topic subscriptions.
//!
//! Subscriptions are declared on a [`DefinitionSetBuilder`] and frozen into an
//! immutable [`DefinitionSet`] that the reconciler and the webhook dispatcher
//! share without synchronisation.
//!
//! ```ignore
//! let definitions = DefinitionSetBuilder::new()
//!     .subscribe(
//!         Subscription::new("http://example.org/topic/appointment-booked", handler)
//!             .filter(FilterBy::new("Appointment", "status", "booked"))
//!             .payload_content(PayloadContent::FullResource),
//!     )
//!     .build()?;
//! ```


use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::gateway::build_filter_criteria;
use crate::DefinitionError;
use crate::HandlerError;
use crate::Result;

/// A resource body as delivered by the remote server.
pub type Resource = serde_json::Value;

/// Payload verbosity requested from the remote server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadContent {
    #[default]
    IdOnly,
    FullResource,
}

impl PayloadContent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadContent::IdOnly => "id-only",
            PayloadContent::FullResource => "full-resource",
        }
    }
}

impl fmt::Display for PayloadContent {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadContent {
    type Err = DefinitionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "id-only" => Ok(PayloadContent::IdOnly),
            "full-resource" => Ok(PayloadContent::FullResource),
            other => Err(DefinitionError::InvalidPayloadContent(other.to_string())),
        }
    }
}

/// Server-side filter. Filters of one subscription are ANDed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterBy {
    #[serde(alias = "resourceType")]
    pub resource_type: String,
    #[serde(alias = "filterParameter")]
    pub filter_parameter: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<String>,
}

impl FilterBy {
    pub fn new(
        resource_type: impl Into<String>,
        filter_parameter: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            filter_parameter: filter_parameter.into(),
            value: value.into(),
            comparator: None,
            modifier: None,
        }
    }

    /// Prefix comparator such as `gt` or `le`.
    pub fn comparator(
        mut self,
        comparator: impl Into<String>,
    ) -> Self {
        self.comparator = Some(comparator.into());
        self
    }

    /// Parameter modifier such as `exact` or `not`.
    pub fn modifier(
        mut self,
        modifier: impl Into<String>,
    ) -> Self {
        self.modifier = Some(modifier.into());
        self
    }
}

/// Application callback invoked once per delivered event.
///
/// `included` is always empty for [`PayloadContent::IdOnly`] subscriptions;
/// handlers that need the resource fetch it themselves.
#[async_trait]
pub trait SubscriptionHandler<C>: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: &C,
        reference: &str,
        included: Vec<Resource>,
        timestamp: Option<DateTime<Utc>>,
    ) -> std::result::Result<(), HandlerError>;
}

/// Values applied to declarations that leave a field unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionDefaults {
    #[serde(default = "default_payload_content")]
    pub payload_content: String,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,

    #[serde(default = "default_heartbeat_period_seconds")]
    pub heartbeat_period_seconds: u32,
}

impl Default for SubscriptionDefaults {
    fn default() -> Self {
        Self {
            payload_content: default_payload_content(),
            timeout_seconds: default_timeout_seconds(),
            heartbeat_period_seconds: default_heartbeat_period_seconds(),
        }
    }
}

fn default_payload_content() -> String {
    PayloadContent::IdOnly.as_str().to_string()
}
fn default_timeout_seconds() -> u32 {
    60
}
fn default_heartbeat_period_seconds() -> u32 {
    20
}

/// A frozen subscription declaration.
pub struct SubscriptionDefinition<C> {
    pub topic: String,
    pub webhook_id: String,
    pub filter_by: Vec<FilterBy>,
    pub payload_content: PayloadContent,
    pub timeout_seconds: u32,
    pub heartbeat_period_seconds: u32,
    pub handler: Arc<dyn SubscriptionHandler<C>>,
}

impl<C> fmt::Debug for SubscriptionDefinition<C> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("SubscriptionDefinition")
            .field("topic", &self.topic)
            .field("webhook_id", &self.webhook_id)
            .field("filter_by", &self.filter_by)
            .field("payload_content", &self.payload_content)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("heartbeat_period_seconds", &self.heartbeat_period_seconds)
            .finish()
    }
}

/// A subscription being declared; unset fields fall back to
/// [`SubscriptionDefaults`] when the set is built.
pub struct Subscription<C> {
    topic: String,
    webhook_id: Option<String>,
    filter_by: Vec<FilterBy>,
    payload_content: Option<String>,
    timeout_seconds: Option<u32>,
    heartbeat_period_seconds: Option<u32>,
    handler: Arc<dyn SubscriptionHandler<C>>,
}

impl<C> Subscription<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(
        topic: impl Into<String>,
        handler: Arc<dyn SubscriptionHandler<C>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            webhook_id: None,
            filter_by: Vec::new(),
            payload_content: None,
            timeout_seconds: None,
            heartbeat_period_seconds: None,
            handler,
        }
    }

    pub fn webhook_id(
        mut self,
        webhook_id: impl Into<String>,
    ) -> Self {
        self.webhook_id = Some(webhook_id.into());
        self
    }

    pub fn filter(
        mut self,
        filter: FilterBy,
    ) -> Self {
        self.filter_by.push(filter);
        self
    }

    pub fn filters(
        mut self,
        filters: impl IntoIterator<Item = FilterBy>,
    ) -> Self {
        self.filter_by.extend(filters);
        self
    }

    pub fn payload_content(
        mut self,
        payload_content: PayloadContent,
    ) -> Self {
        self.payload_content = Some(payload_content.as_str().to_string());
        self
    }

    /// Raw payload content as read from configuration; validated on build.
    pub fn payload_content_str(
        mut self,
        payload_content: impl Into<String>,
    ) -> Self {
        self.payload_content = Some(payload_content.into());
        self
    }

    pub fn timeout_seconds(
        mut self,
        seconds: u32,
    ) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn heartbeat_period_seconds(
        mut self,
        seconds: u32,
    ) -> Self {
        self.heartbeat_period_seconds = Some(seconds);
        self
    }

    fn freeze(
        self,
        defaults: &SubscriptionDefaults,
    ) -> Result<SubscriptionDefinition<C>> {
        let topic = self.topic.trim().to_string();
        if topic.is_empty() {
            return Err(DefinitionError::EmptyTopic.into());
        }

        let webhook_id = match self.webhook_id {
            Some(id) => id,
            None => derive_webhook_id(&topic),
        };
        if !is_valid_webhook_id(&webhook_id) {
            return Err(DefinitionError::InvalidWebhookId(webhook_id).into());
        }

        let payload_content = self
            .payload_content
            .as_deref()
            .unwrap_or(&defaults.payload_content)
            .parse::<PayloadContent>()?;

        let timeout_seconds = self.timeout_seconds.unwrap_or(defaults.timeout_seconds);
        if timeout_seconds == 0 {
            return Err(DefinitionError::NonPositive {
                webhook_id,
                field: "timeout_seconds",
            }
            .into());
        }
        let heartbeat_period_seconds = self
            .heartbeat_period_seconds
            .unwrap_or(defaults.heartbeat_period_seconds);
        if heartbeat_period_seconds == 0 {
            return Err(DefinitionError::NonPositive {
                webhook_id,
                field: "heartbeat_period_seconds",
            }
            .into());
        }

        // Reject filters the criteria syntax cannot express
        build_filter_criteria(&self.filter_by)?;

        Ok(SubscriptionDefinition {
            topic,
            webhook_id,
            filter_by: self.filter_by,
            payload_content,
            timeout_seconds,
            heartbeat_period_seconds,
            handler: self.handler,
        })
    }
}

/// Derive a stable webhook id from a topic url.
///
/// `http://example.org/topic/Appointment-Booked` becomes
/// `example-org-topic-appointment-booked`.
pub fn derive_webhook_id(topic: &str) -> String {
    let without_scheme = topic.split_once("://").map(|(_, rest)| rest).unwrap_or(topic);

    let mut id = String::with_capacity(without_scheme.len());
    for c in without_scheme.chars() {
        if c.is_ascii_alphanumeric() {
            id.push(c.to_ascii_lowercase());
        } else if !id.ends_with('-') {
            id.push('-');
        }
    }
    id.trim_matches('-').to_string()
}

fn is_valid_webhook_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Accumulates declarations before freezing them into a [`DefinitionSet`].
pub struct DefinitionSetBuilder<C> {
    defaults: SubscriptionDefaults,
    subscriptions: Vec<Subscription<C>>,
}

impl<C> Default for DefinitionSetBuilder<C>
where
    C: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C> DefinitionSetBuilder<C>
where
    C: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            defaults: SubscriptionDefaults::default(),
            subscriptions: Vec::new(),
        }
    }

    pub fn defaults(
        mut self,
        defaults: SubscriptionDefaults,
    ) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn subscribe(
        mut self,
        subscription: Subscription<C>,
    ) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    /// Freeze the declarations.
    ///
    /// # Errors
    /// Any [`DefinitionError`]; a duplicate webhook id is always fatal.
    pub fn build(self) -> Result<DefinitionSet<C>> {
        let mut definitions = Vec::with_capacity(self.subscriptions.len());
        let mut index = HashMap::with_capacity(self.subscriptions.len());

        for subscription in self.subscriptions {
            let definition = subscription.freeze(&self.defaults)?;
            if index.contains_key(&definition.webhook_id) {
                return Err(DefinitionError::DuplicateWebhookId(definition.webhook_id).into());
            }
            index.insert(definition.webhook_id.clone(), definitions.len());
            definitions.push(Arc::new(definition));
        }

        Ok(DefinitionSet { definitions, index })
    }
}

/// Immutable registry of declared subscriptions keyed by webhook id.
pub struct DefinitionSet<C> {
    definitions: Vec<Arc<SubscriptionDefinition<C>>>,
    index: HashMap<String, usize>,
}

impl<C> fmt::Debug for DefinitionSet<C> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_list().entries(self.definitions.iter()).finish()
    }
}

impl<C> DefinitionSet<C> {
    pub fn get(
        &self,
        webhook_id: &str,
    ) -> Option<&Arc<SubscriptionDefinition<C>>> {
        self.index.get(webhook_id).map(|i| &self.definitions[*i])
    }

    /// Definitions in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SubscriptionDefinition<C>>> {
        self.definitions.iter()
    }

    pub fn webhook_ids(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().map(|d| d.webhook_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
