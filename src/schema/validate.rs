//! Depth-first validation of JSON data against a [`NormalizedSchema`].
//!
//! The first violation found wins and is reported as a VALIDATION
//! [`RuntimeError`] whose context carries the offending JSON path.

use regex::Regex;
use serde_json::Value;

use super::normalize::{AdditionalProperties, NormalizedSchema, SchemaType};
use crate::errors::{Result, RuntimeError};

/// Validate `data` against `schema`.
pub fn validate(data: &Value, schema: &NormalizedSchema) -> Result<()> {
    validate_at(data, schema, "$")
}

fn fail(path: &str, message: impl Into<String>) -> RuntimeError {
    let message = message.into();
    RuntimeError::validation(format!("{path}: {message}"))
        .with_context(serde_json::json!({ "path": path, "reason": message }))
}

fn child_path(parent: &str, key: &str) -> String {
    format!("{parent}.{key}")
}

fn validate_at(data: &Value, schema: &NormalizedSchema, path: &str) -> Result<()> {
    if data.is_null() && schema.nullable {
        return Ok(());
    }

    check_type(data, schema, path)?;

    if let Some(allowed) = &schema.enum_values {
        if !allowed.iter().any(|v| json_equal(v, data)) {
            return Err(fail(path, format!("value {data} is not one of the allowed values")));
        }
    }

    match data {
        Value::Object(map) => validate_object(map, schema, path)?,
        Value::Array(items) => validate_array(items, schema, path)?,
        Value::String(s) => validate_string(s, schema, path)?,
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                validate_number(f, schema, path)?;
            }
        }
        _ => {}
    }

    validate_composition(data, schema, path)
}

fn check_type(data: &Value, schema: &NormalizedSchema, path: &str) -> Result<()> {
    let ok = match schema.schema_type {
        SchemaType::Any => true,
        SchemaType::Object => data.is_object(),
        SchemaType::Array => data.is_array(),
        SchemaType::String => data.is_string(),
        SchemaType::Boolean => data.is_boolean(),
        SchemaType::Null => data.is_null(),
        SchemaType::Number => data.is_number(),
        SchemaType::Integer => match data {
            Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
            _ => false,
        },
    };
    if ok {
        Ok(())
    } else {
        Err(fail(
            path,
            format!(
                "expected {}, got {}",
                schema.schema_type.as_str(),
                SchemaType::of_value(data).as_str()
            ),
        ))
    }
}

fn validate_object(
    map: &serde_json::Map<String, Value>,
    schema: &NormalizedSchema,
    path: &str,
) -> Result<()> {
    for field in &schema.required {
        if !map.contains_key(field) {
            return Err(fail(&child_path(path, field), format!("missing required field '{field}'"))
                .with_context(serde_json::json!({ "field": field })));
        }
    }

    for (key, value) in map {
        let sub_path = child_path(path, key);
        match schema.properties.get(key) {
            Some(prop) => validate_at(value, prop, &sub_path)?,
            None => match &schema.additional_properties {
                AdditionalProperties::Allowed(true) => {}
                AdditionalProperties::Allowed(false) => {
                    return Err(fail(&sub_path, format!("unknown property '{key}'")));
                }
                AdditionalProperties::Schema(extra) => validate_at(value, extra, &sub_path)?,
            },
        }
    }
    Ok(())
}

fn validate_array(items: &[Value], schema: &NormalizedSchema, path: &str) -> Result<()> {
    if let Some(min) = schema.min_items {
        if items.len() < min {
            return Err(fail(path, format!("expected at least {min} items, got {}", items.len())));
        }
    }
    if let Some(max) = schema.max_items {
        if items.len() > max {
            return Err(fail(path, format!("expected at most {max} items, got {}", items.len())));
        }
    }
    if let Some(item_schema) = &schema.items {
        for (i, item) in items.iter().enumerate() {
            validate_at(item, item_schema, &format!("{path}[{i}]"))?;
        }
    }
    Ok(())
}

fn validate_string(s: &str, schema: &NormalizedSchema, path: &str) -> Result<()> {
    let len = s.chars().count();
    if let Some(min) = schema.min_length {
        if len < min {
            return Err(fail(path, format!("string shorter than {min} characters")));
        }
    }
    if let Some(max) = schema.max_length {
        if len > max {
            return Err(fail(path, format!("string longer than {max} characters")));
        }
    }
    if let Some(pattern) = &schema.pattern {
        // An uncompilable pattern is a schema defect, not a data defect.
        match Regex::new(pattern) {
            Ok(re) if !re.is_match(s) => {
                return Err(fail(path, format!("string does not match pattern '{pattern}'")));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(pattern = %pattern, error = %e, "skipping invalid schema pattern");
            }
        }
    }
    Ok(())
}

fn validate_number(n: f64, schema: &NormalizedSchema, path: &str) -> Result<()> {
    if let Some(min) = schema.minimum {
        if n < min {
            return Err(fail(path, format!("{n} is less than minimum {min}")));
        }
    }
    if let Some(max) = schema.maximum {
        if n > max {
            return Err(fail(path, format!("{n} is greater than maximum {max}")));
        }
    }
    if let Some(min) = schema.exclusive_minimum {
        if n <= min {
            return Err(fail(path, format!("{n} must be greater than {min}")));
        }
    }
    if let Some(max) = schema.exclusive_maximum {
        if n >= max {
            return Err(fail(path, format!("{n} must be less than {max}")));
        }
    }
    Ok(())
}

fn validate_composition(data: &Value, schema: &NormalizedSchema, path: &str) -> Result<()> {
    for branch in &schema.all_of {
        validate_at(data, branch, path)?;
    }

    if !schema.any_of.is_empty()
        && !schema
            .any_of
            .iter()
            .any(|branch| validate_at(data, branch, path).is_ok())
    {
        return Err(fail(path, "value does not match any of the anyOf schemas"));
    }

    if !schema.one_of.is_empty() {
        let matches = schema
            .one_of
            .iter()
            .filter(|branch| validate_at(data, branch, path).is_ok())
            .count();
        if matches != 1 {
            return Err(fail(
                path,
                format!("value matches {matches} oneOf schemas, expected exactly 1"),
            ));
        }
    }
    Ok(())
}

/// Equality that treats `1` and `1.0` as the same number.
fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;
    use crate::schema::normalize_schema;
    use serde_json::json;

    fn person() -> NormalizedSchema {
        normalize_schema(&json!({
            "properties": {"name": {"type": "string"}},
            "required": ["name"]
        }))
    }

    #[test]
    fn test_missing_required_field_names_field() {
        let err = validate(&json!({}), &person()).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(err.message.contains("name"));
        let ctx = err.context.unwrap();
        assert_eq!(ctx["field"], "name");
        assert_eq!(ctx["path"], "$.name");
    }

    #[test]
    fn test_valid_object_passes() {
        assert!(validate(&json!({"name": "x"}), &person()).is_ok());
    }

    #[test]
    fn test_type_mismatch_reports_path() {
        let err = validate(&json!({"name": 5}), &person()).unwrap_err();
        assert!(err.message.contains("$.name"));
        assert!(err.message.contains("expected string"));
    }

    #[test]
    fn test_numeric_bounds() {
        let schema = normalize_schema(&json!({"type": "integer", "minimum": 1, "maximum": 10}));
        assert!(validate(&json!(5), &schema).is_ok());
        assert!(validate(&json!(0), &schema).is_err());
        assert!(validate(&json!(11), &schema).is_err());
        assert!(validate(&json!(2.5), &schema).is_err());
    }

    #[test]
    fn test_string_constraints() {
        let schema = normalize_schema(&json!({
            "type": "string", "minLength": 2, "maxLength": 4, "pattern": "^[a-z]+$"
        }));
        assert!(validate(&json!("abc"), &schema).is_ok());
        assert!(validate(&json!("a"), &schema).is_err());
        assert!(validate(&json!("abcde"), &schema).is_err());
        assert!(validate(&json!("AB"), &schema).is_err());
    }

    #[test]
    fn test_enum_constraint() {
        let schema = normalize_schema(&json!({"enum": ["red", "green"]}));
        assert!(validate(&json!("red"), &schema).is_ok());
        assert!(validate(&json!("blue"), &schema).is_err());
    }

    #[test]
    fn test_array_length_and_items() {
        let schema = normalize_schema(&json!({
            "type": "array", "items": {"type": "string"}, "minItems": 1, "maxItems": 2
        }));
        assert!(validate(&json!(["a"]), &schema).is_ok());
        assert!(validate(&json!([]), &schema).is_err());
        assert!(validate(&json!(["a", "b", "c"]), &schema).is_err());
        let err = validate(&json!(["a", 1]), &schema).unwrap_err();
        assert!(err.message.contains("$[1]"));
    }

    #[test]
    fn test_strict_object_rejects_unknown_property() {
        let schema = normalize_schema(&json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": false
        }));
        assert!(validate(&json!({"a": "x"}), &schema).is_ok());
        let err = validate(&json!({"a": "x", "b": 1}), &schema).unwrap_err();
        assert!(err.message.contains("unknown property 'b'"));
    }

    #[test]
    fn test_nullable_accepts_null() {
        let schema = normalize_schema(&json!({"type": ["string", "null"]}));
        assert!(validate(&Value::Null, &schema).is_ok());
        assert!(validate(&json!("x"), &schema).is_ok());
        assert!(validate(&json!(1), &schema).is_err());
    }

    #[test]
    fn test_any_of_one_of_all_of() {
        let any_of = normalize_schema(&json!({"anyOf": [{"type": "string"}, {"type": "number"}]}));
        assert!(validate(&json!(1), &any_of).is_ok());
        assert!(validate(&json!(true), &any_of).is_err());

        // 5 is both an integer and a number: two branches match.
        let one_of = normalize_schema(&json!({"oneOf": [{"type": "integer"}, {"type": "number"}]}));
        assert!(validate(&json!(5), &one_of).is_err());
        assert!(validate(&json!(5.5), &one_of).is_ok());

        let all_of = normalize_schema(&json!({"allOf": [
            {"type": "number", "minimum": 1},
            {"type": "number", "maximum": 3}
        ]}));
        assert!(validate(&json!(2), &all_of).is_ok());
        assert!(validate(&json!(4), &all_of).is_err());
    }

    #[test]
    fn test_nested_path() {
        let schema = normalize_schema(&json!({
            "properties": {"path": {"properties": {"id": {"type": "string"}}, "required": ["id"]}},
            "required": ["path"]
        }));
        let err = validate(&json!({"path": {}}), &schema).unwrap_err();
        assert_eq!(err.context.unwrap()["path"], "$.path.id");
    }
}
