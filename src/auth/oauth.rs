//! OAuth2 token endpoint calls.
//!
//! Only the client-credentials grant and the refresh-token exchange are
//! implemented. Other flows need a user agent and fail fast.

use std::time::Duration;

use chrono::Utc;
use reqwest::Client as HttpClient;
use serde::Deserialize;

use super::config::AuthResult;
use crate::errors::{codes, ErrorCategory, Result, RuntimeError};

/// Timeout for a token endpoint round trip.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Successful token endpoint response (RFC 6749 §5.1).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Convert into request credentials. The token type defaults to `Bearer`.
    pub fn to_auth_result(&self) -> AuthResult {
        let scheme = match self.token_type.as_deref() {
            Some(t) if t.eq_ignore_ascii_case("bearer") || t.is_empty() => "Bearer",
            Some(t) => t,
            None => "Bearer",
        };
        let mut result = AuthResult::header("Authorization", format!("{scheme} {}", self.access_token));
        result.expires = self.expires_in.and_then(|secs| {
            i64::try_from(secs)
                .ok()
                .map(|s| Utc::now() + chrono::Duration::seconds(s))
        });
        result
    }
}

/// Token endpoint client.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: HttpClient,
}

impl OAuthClient {
    pub fn new() -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RuntimeError::internal(format!("failed to build HTTP client: {e}")).with_cause(e))?;
        Ok(Self { http })
    }

    /// Reject flows that cannot run unattended.
    pub fn ensure_supported_flow(flow: &str) -> Result<()> {
        match flow {
            "clientCredentials" | "client_credentials" => Ok(()),
            other => Err(RuntimeError::new(
                ErrorCategory::Auth,
                codes::AUTH_UNSUPPORTED,
                format!("OAuth2 flow '{other}' is not supported (only clientCredentials)"),
            )),
        }
    }

    /// `grant_type=client_credentials` exchange.
    pub async fn client_credentials(
        &self,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scope: Option<&str>,
    ) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        if let Some(scope) = scope.filter(|s| !s.is_empty()) {
            form.push(("scope", scope));
        }
        self.post_form(token_url, &form).await
    }

    /// `grant_type=refresh_token` exchange.
    pub async fn refresh(
        &self,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<TokenResponse> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        self.post_form(token_url, &form).await
    }

    async fn post_form(&self, token_url: &str, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let grant = form
            .iter()
            .find(|(k, _)| *k == "grant_type")
            .map(|(_, v)| *v)
            .unwrap_or("unknown");
        tracing::debug!(token_url = %token_url, grant, "requesting OAuth2 token");

        let response = self
            .http
            .post(token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| {
                let base = if e.is_timeout() {
                    RuntimeError::timeout(format!("token request to {token_url} timed out"))
                } else {
                    RuntimeError::connection(format!("token request to {token_url} failed: {e}"))
                };
                base.with_cause(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuntimeError::auth(format!(
                "token endpoint returned HTTP {}: {}",
                status.as_u16(),
                body.trim()
            ))
            .with_context(serde_json::json!({ "status": status.as_u16() })));
        }

        response.json::<TokenResponse>().await.map_err(|e| {
            RuntimeError::auth(format!("invalid token response: {e}")).with_cause(e)
        })
    }
}
