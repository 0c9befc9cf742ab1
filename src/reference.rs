//! Reference normalisation.
//!
//! Remote servers are free to send absolute or versioned references
//! (`http://host/fhir/Patient/1/_history/3`). Routing and included-resource
//! lookup always work on the relative `Type/id` form.

/// Reduce a reference to its relative `Type/id` form.
///
/// References without a `/` (e.g. `urn:uuid:...`) are returned unchanged.
pub fn relative_reference(reference: &str) -> String {
    if !reference.contains('/') {
        return reference.to_string();
    }

    let parts: Vec<&str> = reference.split('/').collect();
    let len = parts.len();
    if len >= 4 && parts[len - 2] == "_history" {
        return parts[len - 4..len - 2].join("/");
    }

    parts[len.saturating_sub(2)..].join("/")
}

/// Relative reference of a resource body, built from `resourceType` and `id`.
pub fn resource_reference(resource: &serde_json::Value) -> Option<String> {
    let resource_type = resource.get("resourceType")?.as_str()?;
    let id = resource.get("id")?.as_str()?;
    Some(format!("{resource_type}/{id}"))
}

/// Rewrite every `reference` string nested anywhere in `value` to its
/// relative form.
pub fn relativize_references(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                match inner {
                    serde_json::Value::String(reference) if key == "reference" => {
                        *reference = relative_reference(reference);
                    }
                    _ => relativize_references(inner),
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(relativize_references),
        _ => {}
    }
}
