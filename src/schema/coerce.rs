//! Best-effort coercion of loosely typed data toward a schema.
//!
//! Never fails: values that cannot be converted are returned unchanged and
//! left for [`validate`](super::validate) to reject. Callers opt in
//! explicitly; nothing in the call path coerces on its own.

use serde_json::{Map, Value};

use super::normalize::{AdditionalProperties, NormalizedSchema, SchemaType};

/// Convert `data` toward the shape `schema` describes.
pub fn coerce_to_schema(data: Value, schema: &NormalizedSchema) -> Value {
    match (schema.schema_type, data) {
        (SchemaType::Integer, Value::String(s)) => parse_integer(&s).unwrap_or(Value::String(s)),
        (SchemaType::Number, Value::String(s)) => parse_number(&s).unwrap_or(Value::String(s)),
        (SchemaType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Value::Bool(true),
            "false" | "0" | "no" => Value::Bool(false),
            _ => Value::String(s),
        },
        (SchemaType::String, Value::Number(n)) => Value::String(n.to_string()),
        (SchemaType::String, Value::Bool(b)) => Value::String(b.to_string()),
        (SchemaType::Array, Value::Array(items)) => match &schema.items {
            Some(item_schema) => Value::Array(
                items
                    .into_iter()
                    .map(|item| coerce_to_schema(item, item_schema))
                    .collect(),
            ),
            None => Value::Array(items),
        },
        // A lone value where a list is expected becomes a one-element list.
        (SchemaType::Array, other) if !other.is_null() => {
            let item = match &schema.items {
                Some(item_schema) => coerce_to_schema(other, item_schema),
                None => other,
            };
            Value::Array(vec![item])
        }
        (SchemaType::Object, Value::Object(map)) => Value::Object(coerce_object(map, schema)),
        (SchemaType::Object, Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(map)) => Value::Object(coerce_object(map, schema)),
            _ => Value::String(s),
        },
        (_, other) => other,
    }
}

fn coerce_object(map: Map<String, Value>, schema: &NormalizedSchema) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| {
            let coerced = match schema.properties.get(&key) {
                Some(prop) => coerce_to_schema(value, prop),
                None => match &schema.additional_properties {
                    AdditionalProperties::Schema(extra) => coerce_to_schema(value, extra),
                    AdditionalProperties::Allowed(_) => value,
                },
            };
            (key, coerced)
        })
        .collect()
}

fn parse_integer(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Value::from(i));
    }
    // "3.0" is an integer in disguise; "3.5" is not.
    let f = trimmed.parse::<f64>().ok()?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
        Some(Value::from(f as i64))
    } else {
        None
    }
}

fn parse_number(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Value::from(i));
    }
    let f = trimmed.parse::<f64>().ok()?;
    serde_json::Number::from_f64(f).map(Value::Number)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::normalize_schema;
    use serde_json::json;

    #[test]
    fn test_numeric_strings_become_numbers() {
        let schema = normalize_schema(&json!({
            "properties": {"count": {"type": "integer"}, "ratio": {"type": "number"}}
        }));
        let out = coerce_to_schema(json!({"count": "42", "ratio": "0.5"}), &schema);
        assert_eq!(out, json!({"count": 42, "ratio": 0.5}));
    }

    #[test]
    fn test_unconvertible_values_pass_through() {
        let schema = normalize_schema(&json!({"type": "integer"}));
        assert_eq!(coerce_to_schema(json!("forty"), &schema), json!("forty"));
        assert_eq!(coerce_to_schema(json!("3.5"), &schema), json!("3.5"));
    }

    #[test]
    fn test_boolean_strings() {
        let schema = normalize_schema(&json!({"type": "boolean"}));
        assert_eq!(coerce_to_schema(json!("TRUE"), &schema), json!(true));
        assert_eq!(coerce_to_schema(json!("no"), &schema), json!(false));
    }

    #[test]
    fn test_scalar_wrapped_into_array() {
        let schema = normalize_schema(&json!({"type": "array", "items": {"type": "integer"}}));
        assert_eq!(coerce_to_schema(json!("7"), &schema), json!([7]));
    }

    #[test]
    fn test_json_string_object() {
        let schema = normalize_schema(&json!({"properties": {"n": {"type": "integer"}}}));
        assert_eq!(coerce_to_schema(json!("{\"n\": \"1\"}"), &schema), json!({"n": 1}));
    }
}
