//! HTTP-backed sources: REST endpoints described by OpenAPI/Swagger, and
//! GraphQL endpoints discovered through introspection.
//!
//! Both share [`SourceHttpClient`], which owns one lazily built reqwest
//! client per source and applies static headers and resolved credentials.

pub mod client;
pub mod errors;
pub mod graphql;
pub mod openapi;

pub use client::{HttpRequest, SourceAuth, SourceHttpClient};
pub use errors::HttpError;
pub use graphql::{GraphQlAdapter, GraphQlSourceConfig};
pub use openapi::{derive_tool_name, OpenApiSourceConfig, RestAdapter, SpecSource};
