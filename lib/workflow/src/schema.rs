//! Node configuration schemas.
//!
//! Action types publish a JSON Schema for their configuration. The engine
//! checks node configs against it when a rule is saved and again before each
//! execution. Only the subset of JSON Schema the catalog uses is understood:
//! `type`, `enum`, `required`, `properties`, `additionalProperties: false`,
//! `items`, `minItems`, `maxItems`, `minLength`, `maxLength`, `minimum` and
//! `maximum`. Unknown keywords are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// A JSON Schema describing an action type's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSchema {
    schema: JsonValue,
}

/// A single place where a config value breaks its schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// JSON path of the offending value, rooted at `$`.
    pub path: String,
    /// What is wrong with it.
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for SchemaViolation {}

impl ConfigSchema {
    /// Creates a schema that accepts any value.
    #[must_use]
    pub fn any() -> Self {
        Self {
            schema: serde_json::json!({}),
        }
    }

    /// Creates a schema from a raw JSON value.
    #[must_use]
    pub fn from_json(schema: JsonValue) -> Self {
        Self { schema }
    }

    /// Returns the raw JSON Schema document.
    #[must_use]
    pub fn as_json(&self) -> &JsonValue {
        &self.schema
    }

    /// Validates a value, returning the first violation found.
    ///
    /// # Errors
    ///
    /// Returns the first `SchemaViolation` in document order.
    pub fn validate(&self, value: &JsonValue) -> Result<(), SchemaViolation> {
        match self.violations(value).into_iter().next() {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    /// Returns every violation in the value.
    #[must_use]
    pub fn violations(&self, value: &JsonValue) -> Vec<SchemaViolation> {
        let mut out = Vec::new();
        check(&self.schema, value, "$", &mut out);
        out
    }
}

fn violation(out: &mut Vec<SchemaViolation>, path: &str, message: impl Into<String>) {
    out.push(SchemaViolation {
        path: path.to_string(),
        message: message.into(),
    });
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => "integer",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn matches_type(expected: &str, value: &JsonValue) -> bool {
    match expected {
        "integer" => match value {
            JsonValue::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        "number" => value.is_number(),
        other => type_name(value) == other,
    }
}

fn check(schema: &JsonValue, value: &JsonValue, path: &str, out: &mut Vec<SchemaViolation>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            JsonValue::String(s) => vec![s.as_str()],
            JsonValue::Array(items) => items.iter().filter_map(JsonValue::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, value)) {
            violation(
                out,
                path,
                format!("expected {}, found {}", allowed.join(" or "), type_name(value)),
            );
            // Nested keywords assume the right shape.
            return;
        }
    }

    if let Some(JsonValue::Array(options)) = schema.get("enum")
        && !options.contains(value)
    {
        let listed: Vec<String> = options.iter().map(ToString::to_string).collect();
        violation(out, path, format!("must be one of {}", listed.join(", ")));
    }

    match value {
        JsonValue::Object(map) => {
            if let Some(JsonValue::Array(required)) = schema.get("required") {
                for key in required.iter().filter_map(JsonValue::as_str) {
                    if !map.contains_key(key) {
                        violation(out, path, format!("missing required property '{key}'"));
                    }
                }
            }
            let properties = schema.get("properties").and_then(JsonValue::as_object);
            if let Some(properties) = properties {
                for (key, sub_schema) in properties {
                    if let Some(sub_value) = map.get(key) {
                        check(sub_schema, sub_value, &format!("{path}.{key}"), out);
                    }
                }
            }
            if schema.get("additionalProperties") == Some(&JsonValue::Bool(false)) {
                for key in map.keys() {
                    if !properties.is_some_and(|p| p.contains_key(key)) {
                        violation(out, path, format!("unexpected property '{key}'"));
                    }
                }
            }
        }
        JsonValue::Array(items) => {
            if let Some(min) = schema.get("minItems").and_then(JsonValue::as_u64)
                && (items.len() as u64) < min
            {
                violation(out, path, format!("must contain at least {min} item(s)"));
            }
            if let Some(max) = schema.get("maxItems").and_then(JsonValue::as_u64)
                && (items.len() as u64) > max
            {
                violation(out, path, format!("must contain at most {max} item(s)"));
            }
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{path}[{i}]"), out);
                }
            }
        }
        JsonValue::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(JsonValue::as_u64)
                && len < min
            {
                violation(out, path, format!("must be at least {min} character(s) long"));
            }
            if let Some(max) = schema.get("maxLength").and_then(JsonValue::as_u64)
                && len > max
            {
                violation(out, path, format!("must be at most {max} character(s) long"));
            }
        }
        JsonValue::Number(n) => {
            let Some(n) = n.as_f64() else {
                return;
            };
            if let Some(min) = schema.get("minimum").and_then(JsonValue::as_f64)
                && n < min
            {
                violation(out, path, format!("must be >= {min}"));
            }
            if let Some(max) = schema.get("maximum").and_then(JsonValue::as_f64)
                && n > max
            {
                violation(out, path, format!("must be <= {max}"));
            }
        }
        JsonValue::Null | JsonValue::Bool(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inventory_schema() -> ConfigSchema {
        ConfigSchema::from_json(json!({
            "type": "object",
            "required": ["items"],
            "properties": {
                "items": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "required": ["product_id", "quantity"],
                        "properties": {
                            "product_id": { "type": "string", "minLength": 1 },
                            "quantity": { "type": "integer", "minimum": 1 }
                        }
                    }
                },
                "priority": { "type": "string", "enum": ["low", "high"] }
            },
            "additionalProperties": false
        }))
    }

    #[test]
    fn any_accepts_everything() {
        let schema = ConfigSchema::any();
        assert!(schema.validate(&json!(null)).is_ok());
        assert!(schema.validate(&json!({"a": [1, 2]})).is_ok());
    }

    #[test]
    fn valid_config_passes() {
        let config = json!({
            "items": [{ "product_id": "SKU-1", "quantity": 3 }],
            "priority": "high"
        });
        assert!(inventory_schema().validate(&config).is_ok());
    }

    #[test]
    fn missing_required_property() {
        let err = inventory_schema().validate(&json!({})).unwrap_err();
        assert_eq!(err.path, "$");
        assert!(err.message.contains("'items'"));
    }

    #[test]
    fn nested_paths_are_reported() {
        let config = json!({
            "items": [
                { "product_id": "SKU-1", "quantity": 1 },
                { "product_id": "", "quantity": 0 }
            ]
        });
        let violations = inventory_schema().violations(&config);
        let paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["$.items[1].product_id", "$.items[1].quantity"]);
    }

    #[test]
    fn type_mismatch_stops_descent() {
        let err = inventory_schema()
            .validate(&json!({ "items": "not-a-list" }))
            .unwrap_err();
        assert_eq!(err.path, "$.items");
        assert_eq!(err.message, "expected array, found string");
    }

    #[test]
    fn enum_and_additional_properties() {
        let config = json!({
            "items": [{ "product_id": "SKU-1", "quantity": 1 }],
            "priority": "urgent",
            "extra": true
        });
        let violations = inventory_schema().violations(&config);
        assert_eq!(violations.len(), 2);
        assert!(violations[0].message.contains("must be one of"));
        assert!(violations[1].message.contains("unexpected property 'extra'"));
    }

    #[test]
    fn integer_accepts_whole_floats() {
        let schema = ConfigSchema::from_json(json!({ "type": "integer" }));
        assert!(schema.validate(&json!(2.0)).is_ok());
        assert!(schema.validate(&json!(2.5)).is_err());
    }

    #[test]
    fn empty_schema_on_property_accepts_any_value() {
        let schema = ConfigSchema::from_json(json!({
            "type": "object",
            "properties": { "value": {} }
        }));
        assert!(schema.validate(&json!({ "value": [1, "two", null] })).is_ok());
    }
}
