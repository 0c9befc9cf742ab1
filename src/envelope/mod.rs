//! Inbound notification envelopes.
//!
//! A rest-hook push carries an R4B notification `Bundle`: the first entry is a
//! `SubscriptionStatus`, the remaining entries are resources included
//! alongside the events (present for `full-resource` subscriptions only).


use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::reference::relative_reference;
use crate::reference::relativize_references;
use crate::reference::resource_reference;
use crate::Resource;
use crate::SubscriptionStatus;
use crate::WebhookError;

/// `SubscriptionStatus.type` of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    Handshake,
    Heartbeat,
    EventNotification,
    QueryStatus,
    QueryEvent,
}

impl NotificationType {
    fn parse(code: &str) -> Option<Self> {
        match code {
            "handshake" => Some(NotificationType::Handshake),
            "heartbeat" => Some(NotificationType::Heartbeat),
            "event-notification" => Some(NotificationType::EventNotification),
            "query-status" => Some(NotificationType::QueryStatus),
            "query-event" => Some(NotificationType::QueryEvent),
            _ => None,
        }
    }
}

/// One event inside an envelope, references already made relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub event_number: u64,
    pub focus_reference: String,
    pub additional_context: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NotificationEnvelope {
    pub subscription_topic: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub notification_type: Option<NotificationType>,
    pub events_since_subscription_start: Option<u64>,
    /// Events carried by the bundle, including those skipped for lack of a
    /// focus.
    pub event_count: u64,
    /// Sorted by strictly ascending `event_number`
    pub notification_events: Vec<NotificationEvent>,
    pub included_resources: Vec<Resource>,
    pub timestamp: Option<DateTime<Utc>>,
    included_index: HashMap<String, usize>,
}

impl NotificationEnvelope {
    /// Parse a notification bundle.
    ///
    /// # Errors
    /// [`WebhookError::MalformedPayload`] when the body is not a bundle whose
    /// first entry is a `SubscriptionStatus`, or when event numbers repeat.
    pub fn decode(body: &[u8]) -> std::result::Result<Self, WebhookError> {
        let bundle: RawBundle = serde_json::from_slice(body).map_err(malformed)?;
        if bundle.resource_type != "Bundle" {
            return Err(WebhookError::MalformedPayload(format!(
                "expected Bundle, got {}",
                bundle.resource_type
            )));
        }

        let mut entries = bundle.entry.into_iter();
        let status_resource = entries
            .next()
            .and_then(|e| e.resource)
            .ok_or_else(|| WebhookError::MalformedPayload("bundle has no SubscriptionStatus entry".into()))?;
        let status: RawStatus = serde_json::from_value(status_resource).map_err(malformed)?;
        if status.resource_type != "SubscriptionStatus" {
            return Err(WebhookError::MalformedPayload(format!(
                "first entry must be SubscriptionStatus, got {}",
                status.resource_type
            )));
        }

        // `status` is optional on the wire; a server that omits it is delivering
        let subscription_status = status
            .status
            .as_deref()
            .map(str::parse::<SubscriptionStatus>)
            .transpose()
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?
            .unwrap_or(SubscriptionStatus::Active);
        let events_since_subscription_start = status
            .events_since_subscription_start
            .map(|n| n.value())
            .transpose()?;

        let event_count = status.notification_event.len() as u64;
        let mut notification_events = Vec::with_capacity(status.notification_event.len());
        for event in status.notification_event {
            // Events without a focus carry nothing to hand to a handler
            let Some(focus) = event.focus.and_then(|f| f.reference) else {
                continue;
            };
            notification_events.push(NotificationEvent {
                event_number: event.event_number.value()?,
                focus_reference: relative_reference(&focus),
                additional_context: event
                    .additional_context
                    .into_iter()
                    .filter_map(|c| c.reference)
                    .map(|r| relative_reference(&r))
                    .collect(),
                timestamp: parse_instant(event.timestamp.as_deref())?,
            });
        }
        notification_events.sort_by_key(|e| e.event_number);
        if let Some(pair) = notification_events
            .windows(2)
            .find(|w| w[0].event_number == w[1].event_number)
        {
            return Err(WebhookError::MalformedPayload(format!(
                "event number {} repeated",
                pair[0].event_number
            )));
        }

        let included_resources: Vec<Resource> = entries
            .filter_map(|e| e.resource)
            .map(|mut resource| {
                relativize_references(&mut resource);
                resource
            })
            .collect();
        let included_index = included_resources
            .iter()
            .enumerate()
            .filter_map(|(i, r)| resource_reference(r).map(|reference| (reference, i)))
            .collect();

        Ok(Self {
            subscription_topic: status.topic,
            subscription_status,
            notification_type: status.kind.as_deref().and_then(NotificationType::parse),
            events_since_subscription_start,
            event_count,
            notification_events,
            included_resources,
            timestamp: parse_instant(bundle.timestamp.as_deref())?,
            included_index,
        })
    }

    /// No events to dispatch: a heartbeat (or handshake).
    pub fn is_heartbeat(&self) -> bool {
        self.notification_events.is_empty()
    }

    /// Included resources for an event: additional context resources first,
    /// then the focus resource, each matched on exact `Type/id`.
    pub fn included_for(
        &self,
        event: &NotificationEvent,
    ) -> Vec<Resource> {
        event
            .additional_context
            .iter()
            .chain(std::iter::once(&event.focus_reference))
            .filter_map(|reference| self.included_index.get(reference))
            .map(|i| self.included_resources[*i].clone())
            .collect()
    }

    /// Timestamp handed to handlers for `event`.
    pub fn timestamp_for(
        &self,
        event: &NotificationEvent,
    ) -> Option<DateTime<Utc>> {
        event.timestamp.or(self.timestamp)
    }
}

fn malformed(e: serde_json::Error) -> WebhookError {
    WebhookError::MalformedPayload(e.to_string())
}

fn parse_instant(raw: Option<&str>) -> std::result::Result<Option<DateTime<Utc>>, WebhookError> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| WebhookError::MalformedPayload(format!("invalid instant `{s}`: {e}")))
    })
    .transpose()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBundle {
    resource_type: String,
    timestamp: Option<String>,
    #[serde(default)]
    entry: Vec<RawEntry>,
}

#[derive(Deserialize)]
struct RawEntry {
    resource: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatus {
    resource_type: String,
    status: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    events_since_subscription_start: Option<Integer64>,
    #[serde(default)]
    notification_event: Vec<RawEvent>,
    topic: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    event_number: Integer64,
    timestamp: Option<String>,
    focus: Option<RawReference>,
    #[serde(default)]
    additional_context: Vec<RawReference>,
}

#[derive(Deserialize)]
struct RawReference {
    reference: Option<String>,
}

/// R4B encodes integer64 as a JSON string; some servers send numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum Integer64 {
    Number(u64),
    Text(String),
}

impl Integer64 {
    fn value(&self) -> std::result::Result<u64, WebhookError> {
        match self {
            Integer64::Number(n) => Ok(*n),
            Integer64::Text(s) => s
                .parse()
                .map_err(|_| WebhookError::MalformedPayload(format!("invalid integer64 `{s}`"))),
        }
    }
}
