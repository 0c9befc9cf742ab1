use std::sync::Arc;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::FilterBy;
use crate::Result;
use crate::Subscription;
use crate::SubscriptionHandler;

/// A subscription declared in configuration rather than in code.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub topic: String,

    #[serde(default)]
    pub webhook_id: Option<String>,

    #[serde(default)]
    pub filter_by: Vec<FilterBy>,

    /// `id-only` or `full-resource`; checked when the definition set is built
    #[serde(default)]
    pub payload_content: Option<String>,

    #[serde(default)]
    pub timeout_seconds: Option<u32>,

    #[serde(default)]
    pub heartbeat_period_seconds: Option<u32>,
}

impl SubscriptionEntry {
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "subscriptions[].topic must not be empty".into(),
            )));
        }
        Ok(())
    }

    /// Declaration for this entry; unset fields stay unset so the set's
    /// defaults apply.
    pub fn to_subscription<C>(
        &self,
        handler: Arc<dyn SubscriptionHandler<C>>,
    ) -> Subscription<C>
    where
        C: Send + Sync + 'static,
    {
        let mut subscription = Subscription::new(self.topic.clone(), handler).filters(self.filter_by.clone());
        if let Some(webhook_id) = &self.webhook_id {
            subscription = subscription.webhook_id(webhook_id.clone());
        }
        if let Some(payload_content) = &self.payload_content {
            subscription = subscription.payload_content_str(payload_content.clone());
        }
        if let Some(seconds) = self.timeout_seconds {
            subscription = subscription.timeout_seconds(seconds);
        }
        if let Some(seconds) = self.heartbeat_period_seconds {
            subscription = subscription.heartbeat_period_seconds(seconds);
        }
        subscription
    }
}
