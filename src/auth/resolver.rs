//! Credential resolution with caching and refresh.
//!
//! Resolution steps:
//! 1. Serve from cache when an unexpired entry exists for `(source, authType)`
//! 2. Substitute environment variables throughout the config
//! 3. Dispatch on the auth type (bearer, API key, basic, OAuth2, custom)
//! 4. Cache cacheable results until their expiry (one hour by default)
//!
//! Concurrent resolutions of the same uncached key may both do the work;
//! the last write wins and both results are valid.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};

use super::config::{ApiKeyLocation, AuthConfig, AuthContext, AuthResult};
use super::env::substitute_value;
use super::oauth::OAuthClient;
use crate::errors::{Result, RuntimeError};
use crate::events::{EventBus, EventKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Lifetime of a cached result that declares no expiry.
fn default_ttl() -> chrono::Duration {
    chrono::Duration::hours(1)
}

// ─── Custom Resolvers ────────────────────────────────────────────────────────

/// Host-supplied credential source for `type: custom` configs.
#[async_trait]
pub trait CustomAuthResolver: Send + Sync {
    async fn resolve(&self, ctx: &AuthContext) -> Result<AuthResult>;

    /// Produce fresh credentials after a rejection. `None` means "no refresh
    /// hook"; the resolver then falls back to plain resolution.
    async fn refresh(&self, _ctx: &AuthContext) -> Option<Result<AuthResult>> {
        None
    }
}

// ─── Cache ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    source: String,
    auth_type: &'static str,
}

impl CacheKey {
    fn for_context(ctx: &AuthContext) -> Self {
        Self {
            source: ctx.source.clone(),
            auth_type: ctx.config.auth_type(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: Arc<AuthResult>,
    expires_at: DateTime<Utc>,
    /// Refresh token handed out alongside an OAuth2 access token.
    refresh_token: Option<String>,
}

// ─── AuthResolver ────────────────────────────────────────────────────────────

/// Resolves and caches credentials for sources.
pub struct AuthResolver {
    cache: Mutex<HashMap<CacheKey, CacheEntry>>,
    custom: Mutex<HashMap<String, Arc<dyn CustomAuthResolver>>>,
    oauth: OAuthClient,
    events: EventBus,
}

impl AuthResolver {
    pub fn new(events: EventBus) -> Result<Self> {
        Ok(Self {
            cache: Mutex::new(HashMap::new()),
            custom: Mutex::new(HashMap::new()),
            oauth: OAuthClient::new()?,
            events,
        })
    }

    /// Register a named resolver for `type: custom` configs. Re-registering
    /// a name replaces the previous resolver.
    pub fn register_custom(&self, name: impl Into<String>, resolver: Arc<dyn CustomAuthResolver>) {
        let name = name.into();
        tracing::debug!(resolver = %name, "registered custom auth resolver");
        lock(&self.custom).insert(name, resolver);
    }

    /// Resolve credentials for `ctx`, serving from cache when possible.
    pub async fn resolve(&self, ctx: &AuthContext) -> Result<Arc<AuthResult>> {
        let key = CacheKey::for_context(ctx);
        if let Some(hit) = self.cached(&key) {
            self.events.emit(
                EventKind::AuthCacheHit,
                serde_json::json!({ "source": ctx.source, "authType": key.auth_type }),
            );
            return Ok(hit);
        }

        let config = substitute_config(&ctx.config)?;
        let (result, refresh_token) = self.resolve_fresh(ctx, &config).await?;
        Ok(self.store(key, ctx, result, refresh_token))
    }

    /// Drop the cached entry and obtain new credentials.
    ///
    /// Custom resolvers get their refresh hook; OAuth2 configs exchange a
    /// refresh token when one is known. Otherwise this is a plain resolve.
    pub async fn refresh_auth(&self, ctx: &AuthContext) -> Result<Arc<AuthResult>> {
        let key = CacheKey::for_context(ctx);
        let previous = lock(&self.cache).remove(&key);
        self.events.emit(
            EventKind::AuthRefresh,
            serde_json::json!({ "source": ctx.source, "authType": key.auth_type }),
        );

        let config = substitute_config(&ctx.config)?;
        match &config {
            AuthConfig::Custom { resolver, .. } => {
                let custom = self.custom_resolver(resolver)?;
                if let Some(refreshed) = custom.refresh(ctx).await {
                    return Ok(self.store(key, ctx, refreshed?, None));
                }
            }
            AuthConfig::OAuth2 {
                token_url,
                client_id,
                client_secret,
                refresh_token,
                ..
            } => {
                let known = previous
                    .and_then(|entry| entry.refresh_token)
                    .or_else(|| refresh_token.clone().filter(|t| !t.is_empty()));
                if let Some(token) = known {
                    let response = self
                        .oauth
                        .refresh(token_url, client_id, client_secret, &token)
                        .await?;
                    let next_refresh = response.refresh_token.clone().or(Some(token));
                    return Ok(self.store(key, ctx, response.to_auth_result(), next_refresh));
                }
            }
            _ => {}
        }

        let (result, refresh_token) = self.resolve_fresh(ctx, &config).await?;
        Ok(self.store(key, ctx, result, refresh_token))
    }

    /// Forget every cached credential.
    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
    }

    /// Number of cached entries, expired or not.
    pub fn cache_len(&self) -> usize {
        lock(&self.cache).len()
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn cached(&self, key: &CacheKey) -> Option<Arc<AuthResult>> {
        let mut cache = lock(&self.cache);
        let fresh = cache
            .get(key)
            .map(|entry| (Utc::now() < entry.expires_at).then(|| Arc::clone(&entry.result)));
        match fresh {
            Some(Some(result)) => Some(result),
            Some(None) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(
        &self,
        key: CacheKey,
        ctx: &AuthContext,
        result: AuthResult,
        refresh_token: Option<String>,
    ) -> Arc<AuthResult> {
        let result = Arc::new(result);
        self.events.emit(
            EventKind::AuthResolved,
            serde_json::json!({
                "source": ctx.source,
                "authType": key.auth_type,
                "cacheable": result.cacheable,
                "expires": result.expires,
            }),
        );
        if result.cacheable {
            let expires_at = result.expires.unwrap_or_else(|| Utc::now() + default_ttl());
            lock(&self.cache).insert(
                key,
                CacheEntry {
                    result: Arc::clone(&result),
                    expires_at,
                    refresh_token,
                },
            );
        }
        result
    }

    fn custom_resolver(&self, name: &str) -> Result<Arc<dyn CustomAuthResolver>> {
        lock(&self.custom).get(name).cloned().ok_or_else(|| {
            RuntimeError::config(format!("no custom auth resolver registered as '{name}'"))
        })
    }

    async fn resolve_fresh(
        &self,
        ctx: &AuthContext,
        config: &AuthConfig,
    ) -> Result<(AuthResult, Option<String>)> {
        tracing::debug!(source = %ctx.source, auth_type = config.auth_type(), "resolving credentials");
        match config {
            AuthConfig::Bearer { token } => {
                require_non_empty(token, "bearer token", ctx)?;
                Ok((AuthResult::header("Authorization", format!("Bearer {token}")), None))
            }
            AuthConfig::ApiKey { key, name, location } => {
                require_non_empty(key, "API key", ctx)?;
                let mut result = AuthResult {
                    cacheable: true,
                    ..AuthResult::default()
                };
                let target = match location {
                    ApiKeyLocation::Header => &mut result.headers,
                    ApiKeyLocation::Query => &mut result.query,
                    ApiKeyLocation::Cookie => &mut result.cookies,
                };
                target.insert(name.clone(), key.clone());
                Ok((result, None))
            }
            AuthConfig::Basic { username, password } => {
                require_non_empty(username, "basic auth username", ctx)?;
                let encoded = BASE64.encode(format!("{username}:{password}"));
                Ok((AuthResult::header("Authorization", format!("Basic {encoded}")), None))
            }
            AuthConfig::OAuth2 {
                flow,
                token_url,
                client_id,
                client_secret,
                scope,
                ..
            } => {
                OAuthClient::ensure_supported_flow(flow)?;
                let response = self
                    .oauth
                    .client_credentials(token_url, client_id, client_secret, scope.as_deref())
                    .await?;
                Ok((response.to_auth_result(), response.refresh_token))
            }
            AuthConfig::Custom { resolver, .. } => {
                let custom = self.custom_resolver(resolver)?;
                Ok((custom.resolve(ctx).await?, None))
            }
        }
    }
}

fn substitute_config(config: &AuthConfig) -> Result<AuthConfig> {
    let raw = serde_json::to_value(config)?;
    serde_json::from_value(substitute_value(raw))
        .map_err(|e| RuntimeError::config(format!("invalid auth config after substitution: {e}")))
}

fn require_non_empty(value: &str, what: &str, ctx: &AuthContext) -> Result<()> {
    if value.trim().is_empty() {
        return Err(RuntimeError::auth(format!(
            "{what} for source '{}' is empty (check environment variables)",
            ctx.source
        )));
    }
    Ok(())
}

/// Lock a std mutex, recovering the data if a panicking thread poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
