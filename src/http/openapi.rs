//! REST adapter driven by an OpenAPI 3 or Swagger 2 document.
//!
//! Discovery turns every `path × verb` into a tool whose input schema has
//! `path`, `query`, `headers` and `body` sub-objects. Execution finds the
//! operation again by re-deriving tool names from the cached document, so
//! no separate routing table can drift from it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::client::{HttpRequest, SourceHttpClient};
use super::errors::HttpError;
use crate::adapter::{SourceAdapter, ToolDefinition};
use crate::auth::AuthConfig;
use crate::errors::{Result, RuntimeError};

/// HTTP verbs an OpenAPI path item may declare, in document order.
const VERBS: [&str; 8] = ["get", "put", "post", "delete", "options", "head", "patch", "trace"];

/// Nesting limit when inlining `$ref`s.
const MAX_REF_DEPTH: usize = 32;

// ─── Config ──────────────────────────────────────────────────────────────────

/// Where the API description comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpecSource {
    /// `http(s)://` URL or filesystem path; JSON or YAML.
    Location(String),
    /// The document itself.
    Inline(Value),
}

/// Settings for one REST source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenApiSourceConfig {
    pub spec: SpecSource,
    /// Overrides the server URL declared in the document.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

// ─── Loaded Spec ─────────────────────────────────────────────────────────────

/// A parsed document plus the base URL requests go to.
#[derive(Debug)]
pub struct LoadedSpec {
    pub document: Value,
    pub base_url: Option<String>,
}

/// One operation in the document.
#[derive(Debug, Clone, Copy)]
struct Operation<'a> {
    verb: &'a str,
    path: &'a str,
    path_item: &'a Value,
    op: &'a Value,
}

impl Operation<'_> {
    fn tool_name(&self) -> String {
        match self.op.get("operationId").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => derive_tool_name(self.verb, self.path),
        }
    }
}

fn operations(document: &Value) -> Vec<Operation<'_>> {
    let Some(paths) = document.get("paths").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut ops = Vec::new();
    for (path, path_item) in paths {
        for verb in VERBS {
            if let Some(op) = path_item.get(verb).filter(|v| v.is_object()) {
                ops.push(Operation {
                    verb,
                    path,
                    path_item,
                    op,
                });
            }
        }
    }
    ops
}

// ─── RestAdapter ─────────────────────────────────────────────────────────────

pub struct RestAdapter {
    name: String,
    config: OpenApiSourceConfig,
    http: SourceHttpClient,
    spec: Mutex<Option<Arc<LoadedSpec>>>,
}

impl RestAdapter {
    pub fn new(
        name: impl Into<String>,
        config: OpenApiSourceConfig,
        resolver: Option<Arc<crate::auth::AuthResolver>>,
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
            spec: Mutex::new(None),
        }
    }

    /// Fetch and parse the document, replacing any cached copy.
    pub async fn load_spec(&self) -> std::result::Result<Arc<LoadedSpec>, HttpError> {
        let (document, origin) = match &self.config.spec {
            SpecSource::Inline(doc) => (doc.clone(), None),
            SpecSource::Location(location) => {
                let text = if is_url(location) {
                    self.http.fetch_text(location).await.map_err(|e| HttpError::SpecLoad {
                        location: location.clone(),
                        reason: e.to_string(),
                    })?
                } else {
                    tokio::fs::read_to_string(location).await.map_err(|e| HttpError::SpecLoad {
                        location: location.clone(),
                        reason: e.to_string(),
                    })?
                };
                let doc = parse_document(&text).map_err(|reason| HttpError::SpecLoad {
                    location: location.clone(),
                    reason,
                })?;
                (doc, is_url(location).then(|| location.as_str()))
            }
        };

        if !document.is_object() {
            return Err(HttpError::SpecLoad {
                location: self.location(),
                reason: "document is not an object".into(),
            });
        }

        let base_url = self
            .config
            .base_url
            .clone()
            .or_else(|| declared_base_url(&document, origin));
        let loaded = Arc::new(LoadedSpec { document, base_url });
        *self.lock_spec() = Some(Arc::clone(&loaded));
        tracing::debug!(
            source = %self.name,
            operations = operations(&loaded.document).len(),
            base_url = loaded.base_url.as_deref().unwrap_or("<none>"),
            "loaded API spec"
        );
        Ok(loaded)
    }

    async fn cached_spec(&self) -> std::result::Result<Arc<LoadedSpec>, HttpError> {
        let cached = self.lock_spec().clone();
        match cached {
            Some(spec) => Ok(spec),
            None => self.load_spec().await,
        }
    }

    fn location(&self) -> String {
        match &self.config.spec {
            SpecSource::Location(l) => l.clone(),
            SpecSource::Inline(_) => "<inline>".to_string(),
        }
    }

    fn lock_spec(&self) -> std::sync::MutexGuard<'_, Option<Arc<LoadedSpec>>> {
        self.spec.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl SourceAdapter for RestAdapter {
    fn kind(&self) -> &'static str {
        "openapi"
    }

    async fn discover(&self) -> Result<Vec<ToolDefinition>> {
        let spec = self.load_spec().await?;
        let tools: Vec<ToolDefinition> = operations(&spec.document)
            .into_iter()
            .map(|op| tool_definition(&spec.document, op))
            .collect();
        tracing::debug!(source = %self.name, count = tools.len(), "discovered REST tools");
        Ok(tools)
    }

    async fn execute(&self, tool: &str, params: Value) -> Result<Value> {
        let spec = self.cached_spec().await?;
        let op = operations(&spec.document)
            .into_iter()
            .find(|op| op.tool_name() == tool)
            .ok_or_else(|| HttpError::UnknownTool {
                tool: tool.to_string(),
            })?;

        let base_url = spec.base_url.as_deref().ok_or_else(|| {
            RuntimeError::config(format!(
                "source '{}' has no base URL (set baseUrl or declare servers in the spec)",
                self.name
            ))
        })?;

        let request = build_request(tool, base_url, op, &params)?;
        tracing::debug!(source = %self.name, tool = %tool, method = %request.method, url = %request.url, "executing REST tool");
        self.http.send(tool, &request).await
    }

    async fn validate(&self) -> bool {
        match self.load_spec().await {
            Ok(spec) => spec.base_url.is_some(),
            Err(e) => {
                tracing::debug!(source = %self.name, error = %e, "REST validation failed");
                false
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.lock_spec().take();
        Ok(())
    }
}

// ─── Document Parsing ────────────────────────────────────────────────────────

fn is_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// JSON first, YAML as the fallback.
fn parse_document(text: &str) -> std::result::Result<Value, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(doc) => Ok(doc),
        Err(json_err) => {
            let yaml: serde_yaml::Value = serde_yaml::from_str(text)
                .map_err(|yaml_err| format!("not JSON ({json_err}) or YAML ({yaml_err})"))?;
            // Round-trip so non-string YAML keys (`200:`) become JSON strings.
            serde_json::to_value(yaml).map_err(|e| format!("unsupported YAML structure: {e}"))
        }
    }
}

/// Base URL declared by the document: `servers[0]` (OpenAPI 3) or
/// `schemes/host/basePath` (Swagger 2). Relative server URLs resolve
/// against the origin the document was fetched from.
fn declared_base_url(document: &Value, origin: Option<&str>) -> Option<String> {
    if let Some(server) = document.get("servers").and_then(|s| s.get(0)) {
        let mut url = server.get("url").and_then(Value::as_str)?.to_string();
        if let Some(vars) = server.get("variables").and_then(Value::as_object) {
            for (name, var) in vars {
                if let Some(default) = var.get("default").and_then(Value::as_str) {
                    url = url.replace(&format!("{{{name}}}"), default);
                }
            }
        }
        if url.starts_with('/') {
            return origin.and_then(url_origin).map(|o| format!("{o}{url}"));
        }
        return Some(url);
    }

    if let Some(host) = document.get("host").and_then(Value::as_str) {
        let scheme = document
            .get("schemes")
            .and_then(|s| s.get(0))
            .and_then(Value::as_str)
            .unwrap_or("https");
        let base_path = document.get("basePath").and_then(Value::as_str).unwrap_or("");
        return Some(format!("{scheme}://{host}{base_path}"));
    }

    origin.and_then(url_origin)
}

/// `scheme://authority` of a URL.
fn url_origin(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let authority = rest.split('/').next()?;
    Some(format!("{scheme}://{authority}"))
}

/// Inline local `$ref`s (`#/...`). Remote refs are left as-is; cyclic or
/// unresolvable refs become `{}`.
pub fn resolve_refs(value: &Value, root: &Value) -> Value {
    resolve_refs_in(value, root, &mut Vec::new())
}

fn resolve_refs_in(value: &Value, root: &Value, stack: &mut Vec<String>) -> Value {
    match value {
        Value::Object(map) => {
            if let Some(pointer) = map
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix('#'))
            {
                if stack.len() >= MAX_REF_DEPTH || stack.iter().any(|seen| seen == pointer) {
                    tracing::debug!(reference = pointer, "cyclic or too deep $ref");
                    return json!({});
                }
                let Some(target) = root.pointer(pointer) else {
                    tracing::debug!(reference = pointer, "unresolvable $ref");
                    return json!({});
                };
                stack.push(pointer.to_string());
                let resolved = resolve_refs_in(target, root, stack);
                stack.pop();
                return resolved;
            }
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), resolve_refs_in(v, root, stack)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_refs_in(v, root, stack))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ─── Naming ──────────────────────────────────────────────────────────────────

/// `{verb}_{segments}`: leading `{param}` segments skipped, anything that
/// is not a letter or digit becomes `_`.
///
/// `GET /users/{id}` → `get_users_id`, `POST /{tenant}/orders` → `post_orders`.
pub fn derive_tool_name(verb: &str, path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .skip_while(|s| s.starts_with('{') && s.ends_with('}'))
        .collect();

    let mut name = verb.to_ascii_lowercase();
    for segment in segments {
        name.push('_');
        name.extend(
            segment
                .trim_matches(|c| c == '{' || c == '}')
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }),
        );
    }

    let mut collapsed = String::with_capacity(name.len());
    for c in name.chars() {
        if !(c == '_' && collapsed.ends_with('_')) {
            collapsed.push(c);
        }
    }
    collapsed.trim_end_matches('_').to_string()
}

// ─── Tool Definitions ────────────────────────────────────────────────────────

/// Parameters of an operation, path-level ones overridden by the operation's
/// own (matched on `name` + `in`).
fn parameters(document: &Value, op: Operation<'_>) -> Vec<Value> {
    let mut params: Vec<Value> = Vec::new();
    let declared = op
        .path_item
        .get("parameters")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .chain(op.op.get("parameters").and_then(Value::as_array).into_iter().flatten());
    for raw in declared {
        let param = resolve_refs(raw, document);
        let key = |p: &Value| {
            (
                p.get("name").and_then(Value::as_str).map(str::to_string),
                p.get("in").and_then(Value::as_str).map(str::to_string),
            )
        };
        let k = key(&param);
        params.retain(|p| key(p) != k);
        params.push(param);
    }
    params
}

/// Schema of one parameter; Swagger 2 puts type info on the parameter itself.
fn parameter_schema(param: &Value) -> Value {
    let mut schema = match param.get("schema") {
        Some(s) => s.clone(),
        None => {
            let mut s = Map::new();
            for key in ["type", "format", "items", "enum", "default", "minimum", "maximum", "pattern"] {
                if let Some(v) = param.get(key) {
                    s.insert(key.to_string(), v.clone());
                }
            }
            Value::Object(s)
        }
    };
    if let (Some(desc), Some(obj)) = (param.get("description"), schema.as_object_mut()) {
        obj.entry("description").or_insert_with(|| desc.clone());
    }
    schema
}

/// JSON schema of a request/response `content` map.
fn json_content_schema(content: Option<&Value>) -> Option<Value> {
    let content = content?.as_object()?;
    content
        .iter()
        .find(|(media, _)| media.contains("json"))
        .or_else(|| content.iter().next())
        .and_then(|(_, media)| media.get("schema").cloned())
}

#[derive(Default)]
struct Group {
    properties: Map<String, Value>,
    required: Vec<Value>,
}

impl Group {
    fn into_schema(self) -> Value {
        let mut schema = json!({ "type": "object", "properties": self.properties });
        if !self.required.is_empty() {
            schema["required"] = Value::Array(self.required);
        }
        schema
    }
}

fn input_schema(document: &Value, op: Operation<'_>) -> Value {
    let mut path = Group::default();
    let mut query = Group::default();
    let mut headers = Group::default();
    let mut form = Group::default();
    let mut body: Option<(Value, bool)> = None;

    for param in parameters(document, op) {
        let Some(name) = param.get("name").and_then(Value::as_str) else {
            continue;
        };
        let required = param.get("required").and_then(Value::as_bool).unwrap_or(false);
        let location = param.get("in").and_then(Value::as_str).unwrap_or("query");
        let group = match location {
            "path" => &mut path,
            "query" => &mut query,
            "header" => &mut headers,
            "formData" => &mut form,
            "body" => {
                let schema = param.get("schema").cloned().unwrap_or_else(|| json!({}));
                body = Some((schema, required));
                continue;
            }
            _ => continue,
        };
        group.properties.insert(name.to_string(), parameter_schema(&param));
        // Path parameters are always required, whatever the document says.
        if required || location == "path" {
            group.required.push(Value::String(name.to_string()));
        }
    }

    if let Some(request_body) = op.op.get("requestBody").map(|b| resolve_refs(b, document)) {
        if let Some(schema) = json_content_schema(request_body.get("content")) {
            let required = request_body
                .get("required")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            body = Some((schema, required));
        }
    }
    if body.is_none() && !form.properties.is_empty() {
        let required = !form.required.is_empty();
        body = Some((form.into_schema(), required));
    }

    let mut properties = Map::new();
    let mut required = Vec::new();
    for (key, group) in [("path", path), ("query", query), ("headers", headers)] {
        if group.properties.is_empty() {
            continue;
        }
        if !group.required.is_empty() {
            required.push(Value::String(key.to_string()));
        }
        properties.insert(key.to_string(), group.into_schema());
    }
    if let Some((schema, is_required)) = body {
        properties.insert("body".to_string(), resolve_refs(&schema, document));
        if is_required {
            required.push(Value::String("body".to_string()));
        }
    }

    let mut schema = json!({ "type": "object", "properties": properties });
    if !required.is_empty() {
        schema["required"] = Value::Array(required);
    }
    schema
}

/// Schema of the first 2xx response that declares one.
fn output_schema(document: &Value, op: Operation<'_>) -> Option<Value> {
    let responses = op.op.get("responses")?.as_object()?;
    let mut success: Vec<(&String, &Value)> = responses
        .iter()
        .filter(|(code, _)| code.starts_with('2'))
        .collect();
    success.sort_by(|a, b| a.0.cmp(b.0));
    success.into_iter().find_map(|(_, response)| {
        let response = resolve_refs(response, document);
        json_content_schema(response.get("content"))
            .or_else(|| response.get("schema").cloned())
    })
}

fn tool_definition(document: &Value, op: Operation<'_>) -> ToolDefinition {
    let description = op
        .op
        .get("summary")
        .or_else(|| op.op.get("description"))
        .and_then(Value::as_str)
        .map(str::to_string);
    ToolDefinition {
        name: op.tool_name(),
        description,
        input_schema: input_schema(document, op),
        output_schema: output_schema(document, op),
    }
}

// ─── Request Building ────────────────────────────────────────────────────────

fn build_request(
    tool: &str,
    base_url: &str,
    op: Operation<'_>,
    params: &Value,
) -> std::result::Result<HttpRequest, HttpError> {
    let invalid = |reason: String| HttpError::InvalidRequest {
        tool: tool.to_string(),
        reason,
    };
    let empty = Map::new();
    let params = match params {
        Value::Null => &empty,
        Value::Object(map) => map,
        other => return Err(invalid(format!("params must be an object, got {other}"))),
    };
    let section = |key: &str| params.get(key).and_then(Value::as_object);

    let path_values = section("path");
    let mut path = String::with_capacity(op.path.len());
    let mut rest = op.path;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let name = &rest[start + 1..start + len];
        let value = path_values
            .and_then(|p| p.get(name))
            .filter(|v| !v.is_null())
            .ok_or_else(|| invalid(format!("missing path parameter '{name}'")))?;
        path.push_str(&rest[..start]);
        path.push_str(&percent_encode(&scalar_to_string(value)));
        rest = &rest[start + len + 1..];
    }
    path.push_str(rest);

    let method = Method::from_bytes(op.verb.to_ascii_uppercase().as_bytes())
        .map_err(|e| invalid(format!("bad HTTP verb '{}': {e}", op.verb)))?;
    let mut request = HttpRequest::new(method, format!("{}{}", base_url.trim_end_matches('/'), path));

    if let Some(query) = section("query") {
        for (key, value) in query {
            match value {
                Value::Null => {}
                Value::Array(items) => request
                    .query
                    .extend(items.iter().map(|v| (key.clone(), scalar_to_string(v)))),
                v => request.query.push((key.clone(), scalar_to_string(v))),
            }
        }
    }
    if let Some(headers) = section("headers") {
        for (key, value) in headers.iter().filter(|(_, v)| !v.is_null()) {
            request.headers.push((key.clone(), scalar_to_string(value)));
        }
    }
    if let Some(body) = params.get("body").filter(|b| !b.is_null()) {
        request.body = Some(body.clone());
    }
    Ok(request)
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Percent-encode everything outside RFC 3986 unreserved characters.
fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────
