//! Shared HTTP plumbing for the REST and GraphQL adapters.
//!
//! One [`SourceHttpClient`] per source: a lazily built reqwest client, the
//! source's static headers and optional auth config. Every request gets
//! credentials from the [`AuthResolver`]; a 401 triggers one refresh and
//! one resend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, COOKIE, RETRY_AFTER};
use reqwest::{Client as HttpClient, Method};
use tokio::sync::OnceCell;

use super::errors::HttpError;
use crate::auth::{AuthConfig, AuthContext, AuthResolver, AuthResult};
use crate::errors::Result;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default total request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Request ─────────────────────────────────────────────────────────────────

/// One outgoing call, before auth is applied.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

// ─── SourceHttpClient ────────────────────────────────────────────────────────

/// Auth settings for a source: the config and the resolver that serves it.
#[derive(Clone)]
pub struct SourceAuth {
    pub config: AuthConfig,
    pub resolver: Arc<AuthResolver>,
}

/// HTTP client bound to one source.
pub struct SourceHttpClient {
    source: String,
    timeout: Duration,
    static_headers: BTreeMap<String, String>,
    auth: Option<SourceAuth>,
    http: OnceCell<HttpClient>,
}

impl SourceHttpClient {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            static_headers: BTreeMap::new(),
            auth: None,
            http: OnceCell::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.static_headers = headers;
        self
    }

    pub fn with_auth(mut self, auth: Option<SourceAuth>) -> Self {
        self.auth = auth;
        self
    }

    /// Client for a configured source. Auth without a resolver is dropped
    /// with a warning.
    pub fn configured(
        source: &str,
        headers: &BTreeMap<String, String>,
        timeout_ms: Option<u64>,
        auth: Option<AuthConfig>,
        resolver: Option<Arc<AuthResolver>>,
    ) -> Self {
        let auth = match (auth, resolver) {
            (Some(config), Some(resolver)) => Some(SourceAuth { config, resolver }),
            (Some(_), None) => {
                tracing::warn!(source = %source, "auth configured but no resolver supplied; requests go unauthenticated");
                None
            }
            _ => None,
        };
        let client = Self::new(source)
            .with_headers(headers.clone())
            .with_auth(auth);
        match timeout_ms {
            Some(ms) => client.with_timeout(Duration::from_millis(ms)),
            None => client,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Send `request` on behalf of `tool` and parse the response body.
    ///
    /// JSON bodies are parsed; anything else comes back as a string, and an
    /// empty body as null.
    pub async fn send(&self, tool: &str, request: &HttpRequest) -> Result<serde_json::Value> {
        let credentials = self.credentials(tool, None).await?;
        let first = self.send_once(tool, request, credentials.as_deref()).await;
        match first {
            Err(e) if e.is_auth_rejection() && self.auth.is_some() => {
                tracing::info!(source = %self.source, tool = %tool, "credentials rejected; refreshing");
                let refreshed = self.credentials(tool, credentials).await?;
                Ok(self.send_once(tool, request, refreshed.as_deref()).await?)
            }
            other => Ok(other?),
        }
    }

    /// Send without auth and report whether the endpoint answered at all.
    pub async fn probe(&self, url: &str) -> bool {
        let Ok(http) = self.client().await else {
            return false;
        };
        match http.get(url).timeout(CONNECT_TIMEOUT).send().await {
            Ok(resp) => {
                tracing::debug!(source = %self.source, status = resp.status().as_u16(), "probe answered");
                true
            }
            Err(e) => {
                tracing::debug!(source = %self.source, error = %e, "probe failed");
                false
            }
        }
    }

    /// Fetch a document (API description) with the source's static headers.
    pub async fn fetch_text(&self, url: &str) -> std::result::Result<String, HttpError> {
        let http = self.client().await?;
        let headers = self.header_map(&self.source, &[])?;
        let response = http
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| classify_send_error(url, self.timeout, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpError::Status {
                endpoint: url.to_string(),
                status: status.as_u16(),
                body,
                retry_after: None,
            });
        }
        response
            .text()
            .await
            .map_err(|e| classify_send_error(url, self.timeout, e))
    }

    async fn credentials(
        &self,
        tool: &str,
        rejected: Option<Arc<AuthResult>>,
    ) -> Result<Option<Arc<AuthResult>>> {
        let Some(auth) = &self.auth else {
            return Ok(None);
        };
        let mut ctx = AuthContext::new(self.source.clone(), auth.config.clone()).with_tool(tool);
        let result = match rejected {
            Some(previous) => {
                ctx.previous_attempt = Some(previous);
                auth.resolver.refresh_auth(&ctx).await?
            }
            None => auth.resolver.resolve(&ctx).await?,
        };
        Ok(Some(result))
    }

    async fn client(&self) -> std::result::Result<&HttpClient, HttpError> {
        self.http
            .get_or_try_init(|| async {
                HttpClient::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .timeout(self.timeout)
                    .build()
                    .map_err(|e| HttpError::ClientBuild {
                        reason: e.to_string(),
                    })
            })
            .await
    }

    async fn send_once(
        &self,
        tool: &str,
        request: &HttpRequest,
        credentials: Option<&AuthResult>,
    ) -> std::result::Result<serde_json::Value, HttpError> {
        let http = self.client().await?;

        let mut headers = self.header_map(tool, &request.headers)?;
        let mut query = request.query.clone();
        if let Some(auth) = credentials {
            for (name, value) in &auth.headers {
                insert_header(&mut headers, tool, name, value)?;
            }
            query.extend(auth.query.iter().map(|(k, v)| (k.clone(), v.clone())));
            if let Some(cookie) = auth.cookie_header() {
                insert_header(&mut headers, tool, COOKIE.as_str(), &cookie)?;
            }
        }

        let mut builder = http.request(request.method.clone(), &request.url).headers(headers);
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let started = std::time::Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| classify_send_error(&request.url, self.timeout, e))?;

        let status = response.status();
        tracing::debug!(
            source = %self.source,
            tool = %tool,
            method = %request.method,
            url = %request.url,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "HTTP response"
        );

        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(HttpError::Status {
                endpoint: request.url.clone(),
                status: status.as_u16(),
                body,
                retry_after,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| classify_send_error(&request.url, self.timeout, e))?;
        Ok(parse_body(&text))
    }

    /// Accept header, static headers, then per-request headers (later wins).
    fn header_map(
        &self,
        tool: &str,
        extra: &[(String, String)],
    ) -> std::result::Result<HeaderMap, HttpError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in self.static_headers.iter().chain(extra.iter().map(|(k, v)| (k, v))) {
            insert_header(&mut headers, tool, name, value)?;
        }
        Ok(headers)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn insert_header(
    headers: &mut HeaderMap,
    tool: &str,
    name: &str,
    value: &str,
) -> std::result::Result<(), HttpError> {
    let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| HttpError::InvalidRequest {
        tool: tool.to_string(),
        reason: format!("invalid header name '{name}': {e}"),
    })?;
    let header_value = HeaderValue::from_str(value).map_err(|e| HttpError::InvalidRequest {
        tool: tool.to_string(),
        reason: format!("invalid value for header '{name}': {e}"),
    })?;
    headers.insert(header_name, header_value);
    Ok(())
}

/// Map a reqwest send/read failure: timeout, connect, or anything else.
pub fn classify_send_error(endpoint: &str, timeout: Duration, e: reqwest::Error) -> HttpError {
    if e.is_timeout() {
        HttpError::Timeout {
            endpoint: endpoint.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    } else if e.is_connect() {
        HttpError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        }
    } else {
        HttpError::RequestFailed {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        }
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// JSON if it parses, otherwise the raw text; empty is null.
pub fn parse_body(text: &str) -> serde_json::Value {
    if text.trim().is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_variants() {
        assert!(parse_body("").is_null());
        assert_eq!(parse_body(r#"{"id": 1}"#)["id"], 1);
        assert_eq!(parse_body("plain text"), "plain text");
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_retry_after_past_date_is_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn test_retry_after_missing() {
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn test_header_map_later_wins() {
        let mut static_headers = BTreeMap::new();
        static_headers.insert("X-Team".to_string(), "core".to_string());
        let client = SourceHttpClient::new("svc").with_headers(static_headers);
        let map = client
            .header_map("t", &[("x-team".to_string(), "edge".to_string())])
            .unwrap();
        assert_eq!(map.get("x-team").unwrap(), "edge");
        assert_eq!(map.get(ACCEPT).unwrap(), "application/json");
    }

    #[test]
    fn test_invalid_header_is_invalid_request() {
        let client = SourceHttpClient::new("svc");
        let err = client
            .header_map("t", &[("bad header".to_string(), "v".to_string())])
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_spec_fetch_errors_name_the_source() {
        let mut static_headers = BTreeMap::new();
        static_headers.insert("bad header".to_string(), "v".to_string());
        let client = SourceHttpClient::new("billing").with_headers(static_headers);
        let err = client
            .fetch_text("http://127.0.0.1:9/openapi.json")
            .await
            .unwrap_err();
        match err {
            HttpError::InvalidRequest { tool, .. } => assert_eq!(tool, "billing"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
