//! Authentication resolution.
//!
//! Turns a source's [`AuthConfig`] into request credentials ([`AuthResult`]):
//! - `${VAR}` substitution throughout the config ([`env`])
//! - bearer, API key, basic, OAuth2 client-credentials and custom resolvers
//! - a per-`(source, authType)` cache with expiry and explicit refresh

pub mod config;
pub mod env;
pub mod oauth;
pub mod resolver;

pub use config::{ApiKeyLocation, AuthConfig, AuthContext, AuthResult};
pub use resolver::{AuthResolver, CustomAuthResolver};
