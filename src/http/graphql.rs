//! GraphQL adapter.
//!
//! Discovery runs the introspection query and exposes every non-deprecated
//! `Query` and `Mutation` field as a tool. Execution builds an operation
//! document for the field from its introspected argument types and returns
//! the field's own slice of `data`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::client::{HttpRequest, SourceHttpClient};
use super::errors::HttpError;
use crate::adapter::{SourceAdapter, ToolDefinition};
use crate::auth::{AuthConfig, AuthResolver};
use crate::errors::{Result, RuntimeError};

/// Recursion limit for input-object schemas.
const MAX_INPUT_DEPTH: usize = 5;

/// Tool name used for the introspection request in logs and auth context.
const INTROSPECTION_TOOL: &str = "__introspection";

pub const INTROSPECTION_QUERY: &str = r#"
query IntrospectionQuery {
  __schema {
    queryType { name }
    mutationType { name }
    types {
      kind
      name
      description
      fields(includeDeprecated: true) {
        name
        description
        isDeprecated
        args { ...InputValue }
        type { ...TypeRef }
      }
      inputFields { ...InputValue }
      enumValues(includeDeprecated: false) { name }
    }
  }
}

fragment InputValue on __InputValue {
  name
  description
  defaultValue
  type { ...TypeRef }
}

fragment TypeRef on __Type {
  kind
  name
  ofType {
    kind
    name
    ofType {
      kind
      name
      ofType {
        kind
        name
        ofType { kind name }
      }
    }
  }
}
"#;

// ─── Config ──────────────────────────────────────────────────────────────────

/// Settings for one GraphQL source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQlSourceConfig {
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

// ─── Introspection Types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeRef {
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub of_type: Option<Box<TypeRef>>,
}

impl TypeRef {
    pub fn is_non_null(&self) -> bool {
        self.kind == "NON_NULL"
    }

    /// The innermost named type.
    pub fn named(&self) -> &TypeRef {
        match &self.of_type {
            Some(inner) if self.name.is_none() => inner.named(),
            _ => self,
        }
    }

    /// GraphQL type syntax, e.g. `[ID!]!`.
    pub fn render(&self) -> String {
        match (self.kind.as_str(), &self.of_type) {
            ("NON_NULL", Some(inner)) => format!("{}!", inner.render()),
            ("LIST", Some(inner)) => format!("[{}]", inner.render()),
            _ => self.name.clone().unwrap_or_else(|| "String".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputValue {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub type_ref: TypeRef,
    #[serde(default)]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_deprecated: bool,
    #[serde(default)]
    pub args: Vec<InputValue>,
    #[serde(rename = "type")]
    pub type_ref: TypeRef,
}

#[derive(Debug, Clone, Deserialize)]
struct EnumValue {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FullType {
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    fields: Option<Vec<Field>>,
    #[serde(default)]
    input_fields: Option<Vec<InputValue>>,
    #[serde(default)]
    enum_values: Option<Vec<EnumValue>>,
}

#[derive(Debug, Clone, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSchema {
    #[serde(default)]
    query_type: Option<NamedRef>,
    #[serde(default)]
    mutation_type: Option<NamedRef>,
    #[serde(default)]
    types: Vec<FullType>,
}

/// Introspected schema, indexed by type name.
#[derive(Debug)]
pub struct GraphQlSchema {
    query_type: Option<String>,
    mutation_type: Option<String>,
    types: BTreeMap<String, FullType>,
}

/// Which root type a field lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    fn keyword(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
        }
    }
}

impl GraphQlSchema {
    /// Parse the `data` of an introspection response.
    pub fn from_introspection(data: &Value) -> std::result::Result<Self, String> {
        let raw = data.get("__schema").ok_or("missing __schema")?;
        let raw: RawSchema = serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?;
        Ok(Self {
            query_type: raw.query_type.map(|t| t.name),
            mutation_type: raw.mutation_type.map(|t| t.name),
            types: raw
                .types
                .into_iter()
                .filter_map(|t| t.name.clone().map(|n| (n, t)))
                .collect(),
        })
    }

    fn root_fields(&self, kind: OperationKind) -> &[Field] {
        let root = match kind {
            OperationKind::Query => self.query_type.as_deref(),
            OperationKind::Mutation => self.mutation_type.as_deref(),
        };
        root.and_then(|name| self.types.get(name))
            .and_then(|t| t.fields.as_deref())
            .unwrap_or(&[])
    }

    /// Non-deprecated root fields, queries first.
    pub fn operations(&self) -> Vec<(OperationKind, &Field)> {
        [OperationKind::Query, OperationKind::Mutation]
            .into_iter()
            .flat_map(|kind| {
                self.root_fields(kind)
                    .iter()
                    .filter(|f| !f.is_deprecated)
                    .map(move |f| (kind, f))
            })
            .collect()
    }

    /// Look a field up on `Query`, then on `Mutation`.
    pub fn find(&self, name: &str) -> Option<(OperationKind, &Field)> {
        [OperationKind::Query, OperationKind::Mutation]
            .into_iter()
            .find_map(|kind| {
                self.root_fields(kind)
                    .iter()
                    .find(|f| f.name == name)
                    .map(|f| (kind, f))
            })
    }

    /// JSON schema for one argument or input field type.
    fn type_schema(&self, type_ref: &TypeRef, depth: usize) -> Value {
        match (type_ref.kind.as_str(), &type_ref.of_type) {
            ("NON_NULL", Some(inner)) => self.type_schema(inner, depth),
            ("LIST", Some(inner)) => json!({ "type": "array", "items": self.type_schema(inner, depth) }),
            _ => {
                let name = type_ref.name.as_deref().unwrap_or_default();
                match name {
                    "Int" => json!({ "type": "integer" }),
                    "Float" => json!({ "type": "number" }),
                    "String" | "ID" => json!({ "type": "string" }),
                    "Boolean" => json!({ "type": "boolean" }),
                    _ => match self.types.get(name) {
                        Some(t) if t.kind == "ENUM" => {
                            let values: Vec<&str> = t
                                .enum_values
                                .iter()
                                .flatten()
                                .map(|v| v.name.as_str())
                                .collect();
                            json!({ "type": "string", "enum": values })
                        }
                        Some(t) if t.kind == "INPUT_OBJECT" && depth < MAX_INPUT_DEPTH => {
                            self.object_schema(t.input_fields.as_deref().unwrap_or(&[]), depth + 1)
                        }
                        Some(t) if t.kind == "INPUT_OBJECT" => json!({ "type": "object" }),
                        _ => json!({}),
                    },
                }
            }
        }
    }

    fn object_schema(&self, values: &[InputValue], depth: usize) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for value in values {
            let mut schema = self.type_schema(&value.type_ref, depth);
            if let (Some(desc), Some(obj)) = (&value.description, schema.as_object_mut()) {
                obj.insert("description".into(), Value::String(desc.clone()));
            }
            properties.insert(value.name.clone(), schema);
            if value.type_ref.is_non_null() && value.default_value.is_none() {
                required.push(Value::String(value.name.clone()));
            }
        }
        let mut schema = json!({ "type": "object", "properties": properties });
        if !required.is_empty() {
            schema["required"] = Value::Array(required);
        }
        schema
    }

    pub fn tool_definition(&self, field: &Field) -> ToolDefinition {
        ToolDefinition {
            name: field.name.clone(),
            description: field.description.clone(),
            input_schema: self.object_schema(&field.args, 0),
            output_schema: Some(self.type_schema(&field.type_ref, MAX_INPUT_DEPTH)),
        }
    }

    /// Selection set for a field's return type: scalar and enum fields of an
    /// object (without required args), `__typename` otherwise. Empty for
    /// leaf types.
    fn selection(&self, type_ref: &TypeRef) -> String {
        let named = type_ref.named();
        let Some(t) = named.name.as_deref().and_then(|n| self.types.get(n)) else {
            return String::new();
        };
        match t.kind.as_str() {
            "OBJECT" | "INTERFACE" => {
                let leaves: Vec<&str> = t
                    .fields
                    .iter()
                    .flatten()
                    .filter(|f| !f.is_deprecated)
                    .filter(|f| !f.args.iter().any(|a| a.type_ref.is_non_null()))
                    .filter(|f| {
                        let inner = f.type_ref.named();
                        inner.kind == "SCALAR" || inner.kind == "ENUM"
                    })
                    .map(|f| f.name.as_str())
                    .collect();
                if leaves.is_empty() {
                    " { __typename }".to_string()
                } else {
                    format!(" {{ {} }}", leaves.join(" "))
                }
            }
            "UNION" => " { __typename }".to_string(),
            _ => String::new(),
        }
    }

    /// Operation document for `field`, declaring a variable for each
    /// supplied or required argument.
    pub fn build_document(&self, kind: OperationKind, field: &Field, params: &Map<String, Value>) -> String {
        let args: Vec<&InputValue> = field
            .args
            .iter()
            .filter(|a| params.contains_key(&a.name) || a.type_ref.is_non_null())
            .collect();

        let mut doc = format!("{} {}", kind.keyword(), operation_name(&field.name));
        if !args.is_empty() {
            let decls: Vec<String> = args
                .iter()
                .map(|a| format!("${}: {}", a.name, a.type_ref.render()))
                .collect();
            doc.push_str(&format!("({})", decls.join(", ")));
        }
        doc.push_str(" { ");
        doc.push_str(&field.name);
        if !args.is_empty() {
            let uses: Vec<String> = args.iter().map(|a| format!("{0}: ${0}", a.name)).collect();
            doc.push_str(&format!("({})", uses.join(", ")));
        }
        doc.push_str(&self.selection(&field.type_ref));
        doc.push_str(" }");
        doc
    }
}

/// `getUser` → `GetUser`.
fn operation_name(field: &str) -> String {
    let mut chars = field.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Operation".to_string(),
    }
}

// ─── GraphQlAdapter ──────────────────────────────────────────────────────────

pub struct GraphQlAdapter {
    name: String,
    config: GraphQlSourceConfig,
    http: SourceHttpClient,
    schema: Mutex<Option<Arc<GraphQlSchema>>>,
}

impl GraphQlAdapter {
    pub fn new(
        name: impl Into<String>,
        config: GraphQlSourceConfig,
        resolver: Option<Arc<AuthResolver>>,
    ) -> Self {
        let name = name.into();
        let http = SourceHttpClient::configured(
            &name,
            &config.headers,
            config.timeout_ms,
            config.auth.clone(),
            resolver,
        );
        Self {
            name,
            config,
            http,
            schema: Mutex::new(None),
        }
    }

    /// POST one operation and return `data`, failing on a non-empty `errors`.
    async fn post(&self, tool: &str, query: &str, variables: Value) -> Result<Value> {
        let request = HttpRequest::new(Method::POST, self.config.endpoint.clone())
            .with_body(json!({ "query": query, "variables": variables }));
        let response = self.http.send(tool, &request).await?;

        let Value::Object(mut envelope) = response else {
            return Err(HttpError::InvalidResponse {
                endpoint: self.config.endpoint.clone(),
                reason: "response is not a JSON object".into(),
            }
            .into());
        };

        if let Some(errors) = envelope.remove("errors").filter(|e| match e {
            Value::Array(items) => !items.is_empty(),
            Value::Null => false,
            _ => true,
        }) {
            let message = errors
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|e| e.get("message").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| errors.to_string());
            return Err(HttpError::GraphQl {
                field: tool.to_string(),
                message,
                errors,
            }
            .into());
        }

        Ok(envelope.remove("data").unwrap_or(Value::Null))
    }

    /// Run introspection, replacing any cached schema.
    pub async fn introspect(&self) -> Result<Arc<GraphQlSchema>> {
        let data = self
            .post(INTROSPECTION_TOOL, INTROSPECTION_QUERY, json!({}))
            .await
            .map_err(|e| {
                RuntimeError::discovery(format!("introspection of '{}' failed: {}", self.name, e.message))
                    .with_context(json!({ "source": self.name }))
                    .with_cause(e)
            })?;
        let schema = GraphQlSchema::from_introspection(&data).map_err(|reason| {
            RuntimeError::discovery(format!("invalid introspection result from '{}': {reason}", self.name))
        })?;
        let schema = Arc::new(schema);
        *self.lock_schema() = Some(Arc::clone(&schema));
        Ok(schema)
    }

    async fn cached_schema(&self) -> Result<Arc<GraphQlSchema>> {
        let cached = self.lock_schema().clone();
        match cached {
            Some(schema) => Ok(schema),
            None => self.introspect().await,
        }
    }

    fn lock_schema(&self) -> std::sync::MutexGuard<'_, Option<Arc<GraphQlSchema>>> {
        self.schema.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl SourceAdapter for GraphQlAdapter {
    fn kind(&self) -> &'static str {
        "graphql"
    }

    async fn discover(&self) -> Result<Vec<ToolDefinition>> {
        let schema = self.introspect().await?;
        let tools: Vec<ToolDefinition> = schema
            .operations()
            .into_iter()
            .map(|(_, field)| schema.tool_definition(field))
            .collect();
        tracing::debug!(source = %self.name, count = tools.len(), "discovered GraphQL tools");
        Ok(tools)
    }

    async fn execute(&self, tool: &str, params: Value) -> Result<Value> {
        let schema = self.cached_schema().await?;
        let (kind, field) = schema.find(tool).ok_or_else(|| HttpError::UnknownTool {
            tool: tool.to_string(),
        })?;

        let variables = match params {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(HttpError::InvalidRequest {
                    tool: tool.to_string(),
                    reason: format!("params must be an object, got {other}"),
                }
                .into())
            }
        };
        let document = schema.build_document(kind, field, &variables);
        tracing::debug!(source = %self.name, tool = %tool, operation = kind.keyword(), "executing GraphQL tool");

        let mut data = self.post(tool, &document, Value::Object(variables)).await?;
        Ok(data
            .as_object_mut()
            .and_then(|d| d.remove(tool))
            .unwrap_or(Value::Null))
    }

    async fn validate(&self) -> bool {
        match self.introspect().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(source = %self.name, error = %e, "GraphQL validation failed");
                false
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.lock_schema().take();
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn named(kind: &str, name: &str) -> Value {
        json!({ "kind": kind, "name": name, "ofType": null })
    }

    fn non_null(inner: Value) -> Value {
        json!({ "kind": "NON_NULL", "name": null, "ofType": inner })
    }

    /// Introspection `data` for a small user service.
    pub(crate) fn introspection_data() -> Value {
        json!({
            "__schema": {
                "queryType": { "name": "Query" },
                "mutationType": { "name": "Mutation" },
                "types": [
                    {
                        "kind": "OBJECT", "name": "Query",
                        "fields": [
                            {
                                "name": "user", "description": "Fetch a user", "isDeprecated": false,
                                "args": [
                                    { "name": "id", "type": non_null(named("SCALAR", "ID")) },
                                    { "name": "role", "type": named("ENUM", "Role") }
                                ],
                                "type": named("OBJECT", "User")
                            },
                            {
                                "name": "legacyUser", "isDeprecated": true, "args": [],
                                "type": named("OBJECT", "User")
                            }
                        ]
                    },
                    {
                        "kind": "OBJECT", "name": "Mutation",
                        "fields": [
                            {
                                "name": "createUser", "isDeprecated": false,
                                "args": [{ "name": "input", "type": non_null(named("INPUT_OBJECT", "NewUser")) }],
                                "type": named("OBJECT", "User")
                            }
                        ]
                    },
                    {
                        "kind": "OBJECT", "name": "User",
                        "fields": [
                            { "name": "id", "isDeprecated": false, "args": [], "type": non_null(named("SCALAR", "ID")) },
                            { "name": "name", "isDeprecated": false, "args": [], "type": named("SCALAR", "String") },
                            { "name": "role", "isDeprecated": false, "args": [], "type": named("ENUM", "Role") },
                            { "name": "friends", "isDeprecated": false, "args": [],
                              "type": { "kind": "LIST", "name": null, "ofType": named("OBJECT", "User") } }
                        ]
                    },
                    {
                        "kind": "INPUT_OBJECT", "name": "NewUser",
                        "inputFields": [
                            { "name": "name", "type": non_null(named("SCALAR", "String")) },
                            { "name": "age", "type": named("SCALAR", "Int") }
                        ]
                    },
                    {
                        "kind": "ENUM", "name": "Role",
                        "enumValues": [{ "name": "ADMIN" }, { "name": "MEMBER" }]
                    }
                ]
            }
        })
    }

    fn schema() -> GraphQlSchema {
        GraphQlSchema::from_introspection(&introspection_data()).unwrap()
    }

    #[test]
    fn test_operations_skip_deprecated() {
        let schema = schema();
        let names: Vec<&str> = schema.operations().iter().map(|(_, f)| f.name.as_str()).collect();
        assert_eq!(names, vec!["user", "createUser"]);
    }

    #[test]
    fn test_non_null_args_are_required() {
        let schema = schema();
        let (_, field) = schema.find("user").unwrap();
        let def = schema.tool_definition(field);
        assert_eq!(def.input_schema["required"], json!(["id"]));
        assert_eq!(def.input_schema["properties"]["id"]["type"], "string");
        assert_eq!(def.input_schema["properties"]["role"]["enum"], json!(["ADMIN", "MEMBER"]));
    }

    #[test]
    fn test_input_object_schema() {
        let schema = schema();
        let (kind, field) = schema.find("createUser").unwrap();
        assert_eq!(kind, OperationKind::Mutation);
        let def = schema.tool_definition(field);
        let input = &def.input_schema["properties"]["input"];
        assert_eq!(input["properties"]["age"]["type"], "integer");
        assert_eq!(input["required"], json!(["name"]));
    }

    #[test]
    fn test_build_document_query() {
        let schema = schema();
        let (kind, field) = schema.find("user").unwrap();
        let mut params = Map::new();
        params.insert("id".into(), json!("42"));
        let doc = schema.build_document(kind, field, &params);
        assert_eq!(doc, "query User($id: ID!) { user(id: $id) { id name role } }");
    }

    #[test]
    fn test_build_document_mutation_declares_required_args() {
        let schema = schema();
        let (kind, field) = schema.find("createUser").unwrap();
        let doc = schema.build_document(kind, field, &Map::new());
        assert_eq!(
            doc,
            "mutation CreateUser($input: NewUser!) { createUser(input: $input) { id name role } }"
        );
    }

    #[test]
    fn test_render_nested_type() {
        let t: TypeRef = serde_json::from_value(non_null(json!({
            "kind": "LIST", "name": null, "ofType": non_null(named("SCALAR", "ID"))
        })))
        .unwrap();
        assert_eq!(t.render(), "[ID!]!");
        assert_eq!(t.named().name.as_deref(), Some("ID"));
    }
}
