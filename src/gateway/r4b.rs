//! R4B Subscriptions Backport resource codec.
//!
//! Gateways talking to an R4B server use these helpers to translate between
//! [`SubscriptionSpec`] / [`RemoteSubscriptionRecord`] and the backport
//! `Subscription` resource shape.

use serde_json::json;
use serde_json::Value;

use super::RemoteSubscriptionRecord;
use super::SubscriptionSpec;
use super::SubscriptionStatus;
use crate::GatewayError;
use crate::PayloadContent;
use crate::Result;

pub const BACKPORT_PROFILE: &str =
    "http://hl7.org/fhir/uv/subscriptions-backport/StructureDefinition/backport-subscription";
pub const PAYLOAD_CONTENT_EXTENSION: &str =
    "http://hl7.org/fhir/uv/subscriptions-backport/StructureDefinition/backport-payload-content";
pub const MAX_COUNT_EXTENSION: &str =
    "http://hl7.org/fhir/uv/subscriptions-backport/StructureDefinition/backport-max-count";
pub const HEARTBEAT_PERIOD_EXTENSION: &str =
    "http://hl7.org/fhir/uv/subscriptions-backport/StructureDefinition/backport-heartbeat-period";
pub const TIMEOUT_EXTENSION: &str =
    "http://hl7.org/fhir/uv/subscriptions-backport/StructureDefinition/backport-timeout";
pub const FILTER_CRITERIA_EXTENSION: &str =
    "http://hl7.org/fhir/uv/subscriptions-backport/StructureDefinition/backport-filter-criteria";

const PAYLOAD_MIME_TYPE: &str = "application/fhir+json";

/// Render a [`SubscriptionSpec`] as a new (`requested`) R4B backport Subscription.
pub fn to_subscription(spec: &SubscriptionSpec) -> Value {
    let mut channel = json!({
        "type": "rest-hook",
        "endpoint": spec.channel_endpoint,
        "payload": PAYLOAD_MIME_TYPE,
        "_payload": {
            "extension": [
                { "url": PAYLOAD_CONTENT_EXTENSION, "valueCode": spec.channel_payload.as_str() }
            ]
        },
        "extension": [
            // Notifications are dispatched one event per push
            { "url": MAX_COUNT_EXTENSION, "valuePositiveInt": 1 },
            { "url": HEARTBEAT_PERIOD_EXTENSION, "valuePositiveInt": spec.channel_heartbeat_period },
            { "url": TIMEOUT_EXTENSION, "valuePositiveInt": spec.channel_timeout },
        ],
    });
    if !spec.channel_headers.is_empty() {
        channel["header"] = json!(spec.channel_headers);
    }

    let mut subscription = json!({
        "resourceType": "Subscription",
        "meta": { "profile": [BACKPORT_PROFILE] },
        "status": SubscriptionStatus::Requested.as_str(),
        "reason": format!("Autogenerated subscription for {}", spec.webhook_id),
        "criteria": spec.topic,
        "channel": channel,
    });
    if let Some(criteria) = &spec.criteria {
        subscription["_criteria"] = json!({
            "extension": [ { "url": FILTER_CRITERIA_EXTENSION, "valueString": criteria } ]
        });
    }
    subscription
}

/// Read an R4B backport Subscription back into a record.
pub fn from_subscription(resource: &Value) -> Result<RemoteSubscriptionRecord> {
    let remote_id = str_field(resource, "id")?.to_string();
    let status = str_field(resource, "status")?.parse::<SubscriptionStatus>()?;
    let topic = str_field(resource, "criteria")?.to_string();
    let criteria = extension(resource.get("_criteria"), FILTER_CRITERIA_EXTENSION)
        .and_then(|e| e.get("valueString"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let channel = resource
        .get("channel")
        .ok_or_else(|| GatewayError::Decode("subscription without channel".into()))?;
    let channel_endpoint = str_field(channel, "endpoint")?.to_string();
    let channel_payload = match extension(channel.get("_payload"), PAYLOAD_CONTENT_EXTENSION)
        .and_then(|e| e.get("valueCode"))
        .and_then(Value::as_str)
    {
        Some(code) => code
            .parse::<PayloadContent>()
            .map_err(|e| GatewayError::Decode(e.to_string()))?,
        None => PayloadContent::IdOnly,
    };
    let channel_timeout = positive_int_extension(channel, TIMEOUT_EXTENSION).unwrap_or(0);
    let channel_heartbeat_period =
        positive_int_extension(channel, HEARTBEAT_PERIOD_EXTENSION).unwrap_or(0);
    let channel_headers = channel
        .get("header")
        .and_then(Value::as_array)
        .map(|headers| {
            headers
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(RemoteSubscriptionRecord {
        remote_id,
        status,
        topic,
        criteria,
        channel_endpoint,
        channel_payload,
        channel_timeout,
        channel_heartbeat_period,
        channel_headers,
        last_heartbeat_at: None,
    })
}

fn str_field<'a>(
    value: &'a Value,
    field: &str,
) -> Result<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Decode(format!("missing string field `{field}`")).into())
}

fn extension<'a>(
    element: Option<&'a Value>,
    url: &str,
) -> Option<&'a Value> {
    element?
        .get("extension")?
        .as_array()?
        .iter()
        .find(|e| e.get("url").and_then(Value::as_str) == Some(url))
}

fn positive_int_extension(
    channel: &Value,
    url: &str,
) -> Option<u32> {
    extension(Some(channel), url)?
        .get("valuePositiveInt")?
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
}
