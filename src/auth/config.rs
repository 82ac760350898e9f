//! Auth configuration, request context and resolved credentials.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Config ──────────────────────────────────────────────────────────────────

/// Where an API key travels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    #[default]
    Header,
    Query,
    Cookie,
}

fn default_api_key_name() -> String {
    "X-API-Key".to_string()
}

fn default_oauth_flow() -> String {
    "clientCredentials".to_string()
}

/// Auth configuration for one source, as written in the host's config.
///
/// Every string field may contain `${VAR}` references; they are substituted
/// at resolution time, not at load time.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthConfig {
    Bearer {
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    ApiKey {
        key: String,
        #[serde(default = "default_api_key_name")]
        name: String,
        #[serde(default, rename = "in", alias = "location")]
        location: ApiKeyLocation,
    },
    Basic {
        username: String,
        #[serde(default)]
        password: String,
    },
    #[serde(rename = "oauth2", rename_all = "camelCase")]
    OAuth2 {
        #[serde(default = "default_oauth_flow")]
        flow: String,
        token_url: String,
        client_id: String,
        #[serde(default)]
        client_secret: String,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        refresh_token: Option<String>,
    },
    Custom {
        /// Name of a resolver registered with the `AuthResolver`.
        resolver: String,
        #[serde(default)]
        options: serde_json::Value,
    },
}

impl AuthConfig {
    /// Type label used in cache keys and log fields.
    pub fn auth_type(&self) -> &'static str {
        match self {
            Self::Bearer { .. } => "bearer",
            Self::ApiKey { .. } => "apiKey",
            Self::Basic { .. } => "basic",
            Self::OAuth2 { .. } => "oauth2",
            Self::Custom { .. } => "custom",
        }
    }
}

// Secrets stay out of debug output.
impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer { .. } => f.debug_struct("Bearer").field("token", &"***").finish(),
            Self::ApiKey { name, location, .. } => f
                .debug_struct("ApiKey")
                .field("key", &"***")
                .field("name", name)
                .field("location", location)
                .finish(),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Self::OAuth2 {
                flow,
                token_url,
                client_id,
                scope,
                ..
            } => f
                .debug_struct("OAuth2")
                .field("flow", flow)
                .field("token_url", token_url)
                .field("client_id", client_id)
                .field("client_secret", &"***")
                .field("scope", scope)
                .finish_non_exhaustive(),
            Self::Custom { resolver, .. } => f
                .debug_struct("Custom")
                .field("resolver", resolver)
                .finish_non_exhaustive(),
        }
    }
}

// ─── Context & Result ────────────────────────────────────────────────────────

/// Request-scoped input to the resolver.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub source: String,
    pub tool: Option<String>,
    pub config: AuthConfig,
    /// The result that was rejected, when re-resolving after an auth failure.
    pub previous_attempt: Option<Arc<AuthResult>>,
}

impl AuthContext {
    pub fn new(source: impl Into<String>, config: AuthConfig) -> Self {
        Self {
            source: source.into(),
            tool: None,
            config,
            previous_attempt: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }
}

/// Resolved credentials, ready to apply to an outgoing request.
#[derive(Clone, Default, PartialEq)]
pub struct AuthResult {
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub expires: Option<DateTime<Utc>>,
    pub cacheable: bool,
}

impl AuthResult {
    /// A cacheable result with a single header.
    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut result = Self {
            cacheable: true,
            ..Self::default()
        };
        result.headers.insert(name.into(), value.into());
        result
    }

    /// `Cookie` header value built from `cookies`, if any.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

impl fmt::Debug for AuthResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthResult")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("query", &self.query.keys().collect::<Vec<_>>())
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .field("expires", &self.expires)
            .field("cacheable", &self.cacheable)
            .finish()
    }
}
