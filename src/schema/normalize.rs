//! Schema normalization.
//!
//! Repairs the defects real-world tool schemas ship with before anything
//! validates against them:
//! - a missing `type` is inferred from `properties`, `items` or `enum` values
//! - `type: ["string", "null"]` collapses to `string` plus `nullable`
//! - an object without declared properties accepts any additional property
//!
//! Normalization never fails. Anything it cannot make sense of becomes
//! [`SchemaType::Any`].

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Primitive JSON Schema type after inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
    /// No constraint on the JSON kind.
    Any,
}

impl SchemaType {
    /// Parse a JSON Schema type keyword.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "null" => Some(Self::Null),
            "any" => Some(Self::Any),
            _ => None,
        }
    }

    /// Type of a concrete JSON value.
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    /// Keyword used in error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Null => "null",
            Self::Any => "any",
        }
    }
}

/// How an object treats properties it does not declare.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AdditionalProperties {
    /// `true` or absent.
    Allowed(bool),
    /// Every extra property must match this schema.
    Schema(Box<NormalizedSchema>),
}

impl AdditionalProperties {
    /// Whether unknown properties are rejected outright.
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Allowed(false))
    }
}

/// A schema tree with every node carrying an explicit type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedSchema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, NormalizedSchema>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    pub additional_properties: AdditionalProperties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<NormalizedSchema>>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub one_of: Vec<NormalizedSchema>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<NormalizedSchema>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub all_of: Vec<NormalizedSchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusive_minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusive_maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl NormalizedSchema {
    /// A schema accepting any value.
    pub fn any() -> Self {
        Self {
            schema_type: SchemaType::Any,
            nullable: false,
            description: None,
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: AdditionalProperties::Allowed(true),
            items: None,
            enum_values: None,
            one_of: Vec::new(),
            any_of: Vec::new(),
            all_of: Vec::new(),
            minimum: None,
            maximum: None,
            exclusive_minimum: None,
            exclusive_maximum: None,
            min_length: None,
            max_length: None,
            pattern: None,
            min_items: None,
            max_items: None,
            format: None,
            default: None,
        }
    }

    /// Serialize back into a JSON Schema value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ─── Normalization ───────────────────────────────────────────────────────────

/// Normalize a raw JSON Schema value.
pub fn normalize_schema(raw: &Value) -> NormalizedSchema {
    let Some(obj) = raw.as_object() else {
        // `true` / `{}` / garbage all mean "anything goes".
        return NormalizedSchema::any();
    };

    let mut schema = NormalizedSchema::any();

    let (declared, nullable) = declared_type(obj.get("type"));
    schema.nullable = nullable || obj.get("nullable").and_then(Value::as_bool).unwrap_or(false);

    schema.description = obj
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        schema.properties = props
            .iter()
            .map(|(name, sub)| (name.clone(), normalize_schema(sub)))
            .collect();
    }

    schema.required = obj
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    schema.items = obj.get("items").map(|items| match items {
        // Tuple-style `items: [..]`: validate against the first entry.
        Value::Array(list) => Box::new(
            list.first()
                .map(normalize_schema)
                .unwrap_or_else(NormalizedSchema::any),
        ),
        other => Box::new(normalize_schema(other)),
    });

    schema.enum_values = obj.get("enum").and_then(Value::as_array).cloned();

    schema.one_of = normalize_list(obj.get("oneOf"));
    schema.any_of = normalize_list(obj.get("anyOf"));
    schema.all_of = normalize_list(obj.get("allOf"));

    schema.minimum = obj.get("minimum").and_then(Value::as_f64);
    schema.maximum = obj.get("maximum").and_then(Value::as_f64);
    schema.exclusive_minimum = exclusive_bound(obj.get("exclusiveMinimum"), schema.minimum);
    schema.exclusive_maximum = exclusive_bound(obj.get("exclusiveMaximum"), schema.maximum);
    if obj.get("exclusiveMinimum").and_then(Value::as_bool) == Some(true) {
        schema.minimum = None;
    }
    if obj.get("exclusiveMaximum").and_then(Value::as_bool) == Some(true) {
        schema.maximum = None;
    }

    schema.min_length = as_usize(obj.get("minLength"));
    schema.max_length = as_usize(obj.get("maxLength"));
    schema.pattern = obj.get("pattern").and_then(Value::as_str).map(str::to_string);
    schema.min_items = as_usize(obj.get("minItems"));
    schema.max_items = as_usize(obj.get("maxItems"));
    schema.format = obj.get("format").and_then(Value::as_str).map(str::to_string);
    schema.default = obj.get("default").cloned();

    schema.schema_type = declared.unwrap_or_else(|| infer_type(&schema));

    schema.additional_properties = match obj.get("additionalProperties") {
        Some(Value::Bool(allowed)) => AdditionalProperties::Allowed(*allowed),
        Some(sub @ Value::Object(_)) => AdditionalProperties::Schema(Box::new(normalize_schema(sub))),
        // Absent: permissive, which is what an object without declared
        // properties needs to be usable at all.
        _ => AdditionalProperties::Allowed(true),
    };

    schema
}

/// Read the `type` keyword. Returns the chosen type and whether `null` was
/// one of the alternatives.
fn declared_type(raw: Option<&Value>) -> (Option<SchemaType>, bool) {
    match raw {
        Some(Value::String(s)) => (SchemaType::from_keyword(s), false),
        Some(Value::Array(list)) => {
            let names: Vec<&str> = list.iter().filter_map(Value::as_str).collect();
            let nullable = names.iter().any(|n| *n == "null");
            let first = names
                .iter()
                .find(|n| **n != "null")
                .and_then(|n| SchemaType::from_keyword(n));
            match first {
                Some(t) => (Some(t), nullable),
                // `["null"]` alone really is the null type.
                None if nullable => (Some(SchemaType::Null), false),
                None => (None, false),
            }
        }
        _ => (None, false),
    }
}

fn infer_type(schema: &NormalizedSchema) -> SchemaType {
    if !schema.properties.is_empty() || !schema.required.is_empty() {
        return SchemaType::Object;
    }
    if schema.items.is_some() {
        return SchemaType::Array;
    }
    if let Some(values) = &schema.enum_values {
        return infer_enum_type(values);
    }
    SchemaType::Any
}

/// All enum values sharing one kind give that kind; mixed enums give `Any`.
fn infer_enum_type(values: &[Value]) -> SchemaType {
    let mut kinds = values
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| match SchemaType::of_value(v) {
            SchemaType::Integer => SchemaType::Number,
            other => other,
        });
    let Some(first) = kinds.next() else {
        return SchemaType::Any;
    };
    if kinds.all(|k| k == first) {
        if first == SchemaType::Number && values.iter().all(|v| v.is_null() || v.is_i64() || v.is_u64()) {
            return SchemaType::Integer;
        }
        first
    } else {
        SchemaType::Any
    }
}

fn normalize_list(raw: Option<&Value>) -> Vec<NormalizedSchema> {
    raw.and_then(Value::as_array)
        .map(|arr| arr.iter().map(normalize_schema).collect())
        .unwrap_or_default()
}

/// Draft-4 uses boolean `exclusiveMinimum` modifying `minimum`; later drafts
/// use a number. Accept both.
fn exclusive_bound(raw: Option<&Value>, inclusive: Option<f64>) -> Option<f64> {
    match raw {
        Some(Value::Bool(true)) => inclusive,
        Some(v) => v.as_f64(),
        None => None,
    }
}

fn as_usize(raw: Option<&Value>) -> Option<usize> {
    raw.and_then(Value::as_u64).and_then(|n| usize::try_from(n).ok())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infers_object_from_properties() {
        let schema = normalize_schema(&json!({
            "properties": {"name": {"type": "string"}},
            "required": ["name"]
        }));
        assert_eq!(schema.schema_type, SchemaType::Object);
        assert_eq!(schema.required, vec!["name"]);
        assert_eq!(schema.properties["name"].schema_type, SchemaType::String);
    }

    #[test]
    fn test_infers_array_from_items() {
        let schema = normalize_schema(&json!({"items": {"type": "integer"}}));
        assert_eq!(schema.schema_type, SchemaType::Array);
        assert_eq!(schema.items.unwrap().schema_type, SchemaType::Integer);
    }

    #[test]
    fn test_infers_type_from_enum_values() {
        assert_eq!(
            normalize_schema(&json!({"enum": ["a", "b"]})).schema_type,
            SchemaType::String
        );
        assert_eq!(
            normalize_schema(&json!({"enum": [1, 2, 3]})).schema_type,
            SchemaType::Integer
        );
        assert_eq!(
            normalize_schema(&json!({"enum": [1, 2.5]})).schema_type,
            SchemaType::Number
        );
        assert_eq!(
            normalize_schema(&json!({"enum": ["a", 1]})).schema_type,
            SchemaType::Any
        );
    }

    #[test]
    fn test_type_array_collapses_and_sets_nullable() {
        let schema = normalize_schema(&json!({"type": ["null", "string"]}));
        assert_eq!(schema.schema_type, SchemaType::String);
        assert!(schema.nullable);
    }

    #[test]
    fn test_only_null_type_stays_null() {
        let schema = normalize_schema(&json!({"type": ["null"]}));
        assert_eq!(schema.schema_type, SchemaType::Null);
        assert!(!schema.nullable);
    }

    #[test]
    fn test_empty_object_is_permissive() {
        let schema = normalize_schema(&json!({"type": "object"}));
        assert_eq!(schema.additional_properties, AdditionalProperties::Allowed(true));
    }

    #[test]
    fn test_strict_object_keeps_denial() {
        let schema = normalize_schema(&json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": false
        }));
        assert!(schema.additional_properties.is_denied());
    }

    #[test]
    fn test_non_object_schema_is_any() {
        assert_eq!(normalize_schema(&json!(true)).schema_type, SchemaType::Any);
        assert_eq!(normalize_schema(&json!({})).schema_type, SchemaType::Any);
    }

    #[test]
    fn test_draft4_exclusive_minimum() {
        let schema = normalize_schema(&json!({"type": "number", "minimum": 5, "exclusiveMinimum": true}));
        assert_eq!(schema.exclusive_minimum, Some(5.0));
        assert_eq!(schema.minimum, None);
    }

    #[test]
    fn test_round_trips_to_value_with_type() {
        let schema = normalize_schema(&json!({"properties": {"n": {}}}));
        let value = schema.to_value();
        assert_eq!(value["type"], "object");
        assert_eq!(value["properties"]["n"]["type"], "any");
    }
}
