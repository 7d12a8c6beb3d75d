//! Structural tool-input validation.
//!
//! Shape only: required keys, top-level value types, forbidden extras, and
//! non-empty strings. Semantic and runtime errors (bad syntax inside a
//! script, logic errors) are the adapter's to report as tool failures, not
//! validation failures.

use serde_json::Value;

/// Validate a payload against a tool's declared input schema.
///
/// Returns a structured message on the first violation, `None` when the
/// shape is acceptable. A missing or non-object schema validates nothing.
pub fn validate_shape(tool_name: &str, payload: &Value, schema: Option<&Value>) -> Option<String> {
    let schema = schema?.as_object()?;

    if schema.get("type").and_then(Value::as_str) == Some("object") && !payload.is_object() {
        return Some(format!(
            "{tool_name} expects object input, got {}",
            kind_of(payload)
        ));
    }
    let Some(input) = payload.as_object() else {
        return Some(format!(
            "{tool_name} expects object input, got {}",
            kind_of(payload)
        ));
    };

    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let mut missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|key| !input.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Some(format!("{tool_name} missing required keys: {missing:?}"));
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        let mut unknown: Vec<&str> = input
            .keys()
            .map(String::as_str)
            .filter(|key| !properties.contains_key(*key))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Some(format!("{tool_name} input had unknown keys: {unknown:?}"));
        }
    }

    for (key, spec) in &properties {
        let Some(value) = input.get(key) else {
            continue;
        };
        let expected = spec.get("type").and_then(Value::as_str);
        let violation = match expected {
            Some("string") => match value.as_str() {
                Some(text) if !text.trim().is_empty() => None,
                _ => Some(format!(
                    "{tool_name} requires non-empty string {key}, got {value}"
                )),
            },
            Some("object") if !value.is_object() => {
                Some(format!("{tool_name} requires object {key}, got {value}"))
            }
            Some("array") if !value.is_array() => {
                Some(format!("{tool_name} requires array {key}, got {value}"))
            }
            Some("integer") if !value.is_i64() && !value.is_u64() => {
                Some(format!("{tool_name} requires integer {key}, got {value}"))
            }
            Some("number") if !value.is_number() => {
                Some(format!("{tool_name} requires number {key}, got {value}"))
            }
            Some("boolean") if !value.is_boolean() => {
                Some(format!("{tool_name} requires boolean {key}, got {value}"))
            }
            _ => None,
        };
        if violation.is_some() {
            return violation;
        }
    }

    None
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {"script": {"type": "string"}},
            "required": ["script"],
            "additionalProperties": false,
        })
    }

    #[test]
    fn test_valid_payload_passes() {
        let payload = json!({"script": "LOAD \"sales.csv\""});
        assert!(validate_shape("run_gridtool", &payload, Some(&schema())).is_none());
    }

    #[test]
    fn test_missing_required_key() {
        let message =
            validate_shape("run_gridtool", &json!({}), Some(&schema())).unwrap();
        assert!(message.contains("missing required keys"), "{message}");
        assert!(message.contains("script"));
    }

    #[test]
    fn test_unknown_extra_key() {
        let payload = json!({"script": "SHOW", "mode": "fast"});
        let message = validate_shape("run_gridtool", &payload, Some(&schema())).unwrap();
        assert!(message.contains("unknown keys"), "{message}");
    }

    #[test]
    fn test_wrong_top_level_type() {
        let message =
            validate_shape("run_gridtool", &json!("SHOW"), Some(&schema())).unwrap();
        assert!(message.contains("expects object input, got string"), "{message}");
    }

    #[test]
    fn test_empty_string_rejected() {
        let message =
            validate_shape("run_gridtool", &json!({"script": "  "}), Some(&schema())).unwrap();
        assert!(message.contains("non-empty string"), "{message}");
    }

    #[test]
    fn test_no_schema_validates_nothing() {
        assert!(validate_shape("tool", &json!("whatever"), None).is_none());
    }

    #[test]
    fn test_semantic_errors_are_not_caught_here() {
        // A syntactically wrong script is still a valid shape.
        let payload = json!({"script": "KEEP amount > 100"});
        assert!(validate_shape("run_gridtool", &payload, Some(&schema())).is_none());
    }
}
