//! OAuth2 token exchanges against a loopback token endpoint.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use common::{MockHttpServer, MockResponse};
use toolbridge::auth::AuthContext;
use toolbridge::{AuthConfig, AuthResolver, ErrorCategory, EventBus};

fn client_credentials(token_url: String) -> AuthContext {
    AuthContext::new(
        "crm",
        AuthConfig::OAuth2 {
            flow: "clientCredentials".to_string(),
            token_url,
            client_id: "id".to_string(),
            client_secret: "sec".to_string(),
            scope: Some("read".to_string()),
            refresh_token: None,
        },
    )
}

fn form_body(server: &MockHttpServer, index: usize) -> String {
    String::from_utf8(server.requests()[index].body.clone()).unwrap()
}

#[tokio::test]
async fn test_client_credentials_then_refresh_token_exchange() {
    let issued = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&issued);
    let server = MockHttpServer::start(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        MockResponse::json(
            200,
            &json!({
                "access_token": format!("AT{n}"),
                "token_type": "bearer",
                "expires_in": 600,
                "refresh_token": "RT1"
            }),
        )
    })
    .await;
    let resolver = AuthResolver::new(EventBus::default()).unwrap();
    let ctx = client_credentials(format!("{}/token", server.url()));

    let first = resolver.resolve(&ctx).await.unwrap();

    assert_eq!(first.headers["Authorization"], "Bearer AT1");
    let expires = first.expires.expect("expiry from expires_in");
    assert!(expires > Utc::now() + chrono::Duration::seconds(500));
    assert!(expires <= Utc::now() + chrono::Duration::seconds(600));
    let request = &server.requests()[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.path(), "/token");
    assert_eq!(
        request.header("content-type"),
        Some("application/x-www-form-urlencoded")
    );
    assert_eq!(
        form_body(&server, 0),
        "grant_type=client_credentials&client_id=id&client_secret=sec&scope=read"
    );

    // Cached until expiry.
    resolver.resolve(&ctx).await.unwrap();
    assert_eq!(server.request_count(), 1);

    let refreshed = resolver.refresh_auth(&ctx).await.unwrap();

    assert_eq!(refreshed.headers["Authorization"], "Bearer AT2");
    assert_eq!(server.request_count(), 2);
    assert_eq!(
        form_body(&server, 1),
        "grant_type=refresh_token&refresh_token=RT1&client_id=id&client_secret=sec"
    );
}

#[tokio::test]
async fn test_refresh_without_known_token_repeats_client_credentials() {
    let server = MockHttpServer::start(|_| {
        MockResponse::json(200, &json!({ "access_token": "plain", "expires_in": 60 }))
    })
    .await;
    let resolver = AuthResolver::new(EventBus::default()).unwrap();
    let ctx = client_credentials(format!("{}/token", server.url()));

    resolver.resolve(&ctx).await.unwrap();
    let refreshed = resolver.refresh_auth(&ctx).await.unwrap();

    assert_eq!(refreshed.headers["Authorization"], "Bearer plain");
    assert!(form_body(&server, 1).starts_with("grant_type=client_credentials&"));
}

#[tokio::test]
async fn test_token_endpoint_rejection_is_auth_error() {
    let server = MockHttpServer::start(|_| {
        MockResponse::json(401, &json!({ "error": "invalid_client" }))
    })
    .await;
    let resolver = AuthResolver::new(EventBus::default()).unwrap();
    let ctx = client_credentials(format!("{}/token", server.url()));

    let err = resolver.resolve(&ctx).await.unwrap_err();

    assert_eq!(err.category, ErrorCategory::Auth);
    assert!(err.message.contains("HTTP 401"), "{}", err.message);
    assert_eq!(resolver.cache_len(), 0);
}
