use std::fmt::Write;

use crate::DefinitionError;
use crate::FilterBy;
use crate::GatewayError;
use crate::Result;

/// Serialize filters into the `ResourceType?param=value&...` criteria syntax.
///
/// Returns `Ok(None)` when there are no filters. Every filter must target the
/// same resource type.
pub fn build_filter_criteria(filters: &[FilterBy]) -> Result<Option<String>> {
    let Some(first) = filters.first() else {
        return Ok(None);
    };

    let mut query = String::new();
    for filter in filters {
        if filter.resource_type != first.resource_type {
            return Err(DefinitionError::MixedFilterResourceTypes {
                first: first.resource_type.clone(),
                other: filter.resource_type.clone(),
            }
            .into());
        }

        let name = match &filter.modifier {
            Some(modifier) => format!("{}:{}", filter.filter_parameter, modifier),
            None => filter.filter_parameter.clone(),
        };
        let value = match &filter.comparator {
            Some(comparator) => format!("{}{}", comparator, filter.value),
            None => filter.value.clone(),
        };

        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&encode_component(&name));
        query.push('=');
        query.push_str(&encode_component(&value));
    }

    Ok(Some(format!("{}?{}", first.resource_type, query)))
}

/// Percent-encode a query component, keeping `:` and `,` readable.
pub(crate) fn encode_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' | b',' => {
                encoded.push(byte as char)
            }
            _ => {
                let _ = write!(encoded, "%{byte:02X}");
            }
        }
    }
    encoded
}

/// Split `ResourceType?param[:modifier]=value&...` back into filters.
///
/// Comparator prefixes cannot be told apart from the value, so they stay in
/// `value`; rebuilding the criteria yields the same string.
pub fn parse_filter_criteria(criteria: &str) -> Result<Vec<FilterBy>> {
    let (resource_type, query) = criteria
        .split_once('?')
        .ok_or_else(|| GatewayError::Decode(format!("criteria `{criteria}` has no query")))?;

    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| GatewayError::Decode(format!("criteria parameter `{pair}` has no value")))?;
            let name = decode_component(name)?;
            let value = decode_component(value)?;
            let filter = match name.split_once(':') {
                Some((parameter, modifier)) => FilterBy::new(resource_type, parameter, value).modifier(modifier),
                None => FilterBy::new(resource_type, name.as_str(), value),
            };
            Ok(filter)
        })
        .collect()
}

pub(crate) fn decode_component(raw: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let byte = raw
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| GatewayError::Decode(format!("invalid percent escape in `{raw}`")))?;
            decoded.push(byte);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).map_err(|e| GatewayError::Decode(e.to_string()).into())
}
