//! R5 `Subscription` resource codec.
//!
//! R5 servers carry the backport extensions as first-class elements: the
//! topic, channel type, payload content and limits sit at the top level and
//! channel headers travel as `parameter` name/value pairs.

use serde_json::json;
use serde_json::Value;

use super::build_filter_criteria;
use super::parse_filter_criteria;
use super::RemoteSubscriptionRecord;
use super::SubscriptionSpec;
use super::SubscriptionStatus;
use crate::FilterBy;
use crate::GatewayError;
use crate::PayloadContent;
use crate::Result;

pub const CHANNEL_TYPE_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/subscription-channel-type";

const PAYLOAD_MIME_TYPE: &str = "application/fhir+json";

/// Render a [`SubscriptionSpec`] as a new (`requested`) R5 Subscription.
pub fn to_subscription(spec: &SubscriptionSpec) -> Result<Value> {
    let mut subscription = json!({
        "resourceType": "Subscription",
        "status": SubscriptionStatus::Requested.as_str(),
        "reason": format!("Autogenerated subscription for {}", spec.webhook_id),
        "topic": spec.topic,
        "channelType": { "system": CHANNEL_TYPE_SYSTEM, "code": "rest-hook" },
        "endpoint": spec.channel_endpoint,
        "contentType": PAYLOAD_MIME_TYPE,
        "content": spec.channel_payload.as_str(),
        "maxCount": 1,
        "heartbeatPeriod": spec.channel_heartbeat_period,
        "timeout": spec.channel_timeout,
    });

    let parameters: Vec<Value> = spec
        .channel_headers
        .iter()
        .filter_map(|header| header.split_once(':'))
        .map(|(name, value)| json!({ "name": name.trim(), "value": value.trim() }))
        .collect();
    if !parameters.is_empty() {
        subscription["parameter"] = Value::Array(parameters);
    }

    if let Some(criteria) = &spec.criteria {
        let filters: Vec<Value> = parse_filter_criteria(criteria)?
            .into_iter()
            .map(|filter| {
                let mut element = json!({
                    "resourceType": filter.resource_type,
                    "filterParameter": filter.filter_parameter,
                    "value": filter.value,
                });
                if let Some(modifier) = filter.modifier {
                    element["modifier"] = json!(modifier);
                }
                element
            })
            .collect();
        subscription["filterBy"] = Value::Array(filters);
    }

    Ok(subscription)
}

/// Read an R5 Subscription back into a record.
pub fn from_subscription(resource: &Value) -> Result<RemoteSubscriptionRecord> {
    let remote_id = str_field(resource, "id")?.to_string();
    let status = str_field(resource, "status")?.parse::<SubscriptionStatus>()?;
    let topic = str_field(resource, "topic")?.to_string();
    let channel_endpoint = str_field(resource, "endpoint")?.to_string();

    let channel_payload = match resource.get("content").and_then(Value::as_str) {
        Some(code) => code
            .parse::<PayloadContent>()
            .map_err(|e| GatewayError::Decode(e.to_string()))?,
        None => PayloadContent::IdOnly,
    };

    let filters = resource
        .get("filterBy")
        .and_then(Value::as_array)
        .map(|elements| elements.iter().map(filter_by).collect::<Result<Vec<_>>>())
        .transpose()?
        .unwrap_or_default();
    let criteria = build_filter_criteria(&filters)?;

    let channel_headers = resource
        .get("parameter")
        .and_then(Value::as_array)
        .map(|parameters| {
            parameters
                .iter()
                .filter_map(|p| {
                    let name = p.get("name")?.as_str()?;
                    let value = p.get("value")?.as_str()?;
                    Some(format!("{name}: {value}"))
                })
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
        channel_timeout: unsigned_field(resource, "timeout"),
        channel_heartbeat_period: unsigned_field(resource, "heartbeatPeriod"),
        channel_headers,
        last_heartbeat_at: None,
    })
}

fn filter_by(element: &Value) -> Result<FilterBy> {
    let resource_type = str_field(element, "resourceType")?;
    let parameter = str_field(element, "filterParameter")?;
    let value = str_field(element, "value")?;

    let mut filter = FilterBy::new(resource_type, parameter, value);
    if let Some(comparator) = element.get("comparator").and_then(Value::as_str) {
        filter = filter.comparator(comparator);
    }
    if let Some(modifier) = element.get("modifier").and_then(Value::as_str) {
        filter = filter.modifier(modifier);
    }
    Ok(filter)
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

fn unsigned_field(
    value: &Value,
    field: &str,
) -> u32 {
    value
        .get(field)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}
