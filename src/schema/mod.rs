//! Schema normalization, validation and coercion.
//!
//! Tool schemas arrive from MCP servers, OpenAPI documents and GraphQL
//! introspection in every state of disrepair. This module is the single
//! place that imposes structure on them:
//! - [`normalize_schema`] turns a raw JSON Schema value into a [`NormalizedSchema`]
//! - [`validate`] walks data against it and fails with a VALIDATION error
//! - [`coerce_to_schema`] nudges loosely typed data toward it, never failing

pub mod coerce;
pub mod normalize;
pub mod validate;

pub use coerce::coerce_to_schema;
pub use normalize::{normalize_schema, AdditionalProperties, NormalizedSchema, SchemaType};
pub use validate::validate;

use serde_json::Value;

use crate::errors::Result;

/// Normalize `raw` and validate `data` against it in one step.
pub fn validate_raw(data: &Value, raw: &Value) -> Result<()> {
    validate(data, &normalize_schema(raw))
}
