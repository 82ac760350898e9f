//! Whole-runtime tests: config → registry → dispatcher → adapters.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use common::{MockHttpServer, MockResponse};
use toolbridge::mcp::{McpAdapter, McpServerConfig};
use toolbridge::{
    ErrorCategory, EventBus, EventKind, Runtime, RuntimeConfig, RuntimeEvent, SourceAdapter,
};

fn users_spec() -> Value {
    json!({
        "openapi": "3.0.0",
        "paths": {
            "/users/{id}": {
                "get": {
                    "operationId": "getUser",
                    "parameters": [{ "name": "id", "in": "path", "required": true }],
                    "responses": { "200": { "description": "ok" } }
                }
            }
        }
    })
}

fn config_for(server: &MockHttpServer, extra_sources: Value) -> RuntimeConfig {
    let mut sources = json!({
        "users": {
            "type": "openapi",
            "spec": users_spec(),
            "baseUrl": server.url(),
            "timeoutMs": 2000
        }
    });
    if let (Some(target), Some(extra)) = (sources.as_object_mut(), extra_sources.as_object()) {
        target.extend(extra.clone());
    }
    let text = json!({
        "retry": { "maxAttempts": 3, "initialDelayMs": 1, "maxDelayMs": 5, "jitter": false },
        "sources": sources
    })
    .to_string();
    RuntimeConfig::from_json_str(&text).unwrap()
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_call_routes_through_dispatcher() {
    let server = MockHttpServer::start(|req| match req.path() {
        "/users/42" => MockResponse::json(200, &json!({ "id": 42 })),
        _ => MockResponse::text(404, "not found"),
    })
    .await;
    let runtime = Runtime::from_config(&config_for(&server, json!({}))).unwrap();
    let mut rx = runtime.events.subscribe();

    let result = runtime
        .call("users__getUser", json!({ "path": { "id": 42 } }))
        .await
        .unwrap();

    assert_eq!(result, json!({ "id": 42 }));
    assert_eq!(server.requests()[0].target, "/users/42");
    let kinds: Vec<EventKind> = drain(&mut rx).iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::CallStart, EventKind::CallSuccess]);
}

#[tokio::test]
async fn test_server_errors_are_retried_by_dispatcher() {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&hits);
    let server = MockHttpServer::start(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            MockResponse::text(503, "warming up")
        } else {
            MockResponse::json(200, &json!({ "id": "7" }))
        }
    })
    .await;
    let runtime = Runtime::from_config(&config_for(&server, json!({}))).unwrap();
    let mut rx = runtime.events.subscribe();

    let result = runtime
        .call("users__getUser", json!({ "path": { "id": "7" } }))
        .await
        .unwrap();

    assert_eq!(result["id"], "7");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    let events = drain(&mut rx);
    let retry = events
        .iter()
        .find(|e| e.kind == EventKind::CallRetry)
        .expect("retry event");
    assert_eq!(retry.data["attempt"], 1);
    assert_eq!(retry.data["error"]["category"], "EXECUTION");
}

#[tokio::test]
async fn test_client_errors_surface_without_retry() {
    let server = MockHttpServer::start(|_| MockResponse::text(404, "no such user")).await;
    let runtime = Runtime::from_config(&config_for(&server, json!({}))).unwrap();

    let err = runtime
        .call("users__getUser", json!({ "path": { "id": "0" } }))
        .await
        .unwrap_err();

    assert_eq!(err.category, ErrorCategory::Execution);
    assert_eq!(err.status(), Some(404));
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn test_discover_all_survives_broken_source() {
    let server = MockHttpServer::start(|_| MockResponse::text(404, "")).await;
    let config = config_for(
        &server,
        json!({
            "broken": { "type": "mcp", "command": "/nonexistent/toolbridge-test-server", "maxRetries": 0 }
        }),
    );
    let runtime = Runtime::from_config(&config).unwrap();

    let catalog = runtime.dispatcher.discover_all().await;

    assert!(catalog["broken"].is_empty());
    assert_eq!(catalog["users"].len(), 1);
    assert_eq!(catalog["users"][0].name, "getUser");
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_mcp_spawn_failure_exhausts_reconnects() {
    let server = MockHttpServer::start(|_| MockResponse::text(404, "")).await;
    let config = config_for(
        &server,
        json!({
            "local": { "type": "mcp", "command": "/nonexistent/toolbridge-test-server", "maxRetries": 1 }
        }),
    );
    let runtime = Runtime::from_config(&config).unwrap();
    let mut rx = runtime.events.subscribe();

    let err = runtime.call("local__anything", json!({})).await.unwrap_err();

    assert_eq!(err.category, ErrorCategory::Execution);
    let connection_errors = drain(&mut rx)
        .into_iter()
        .filter(|e| e.kind == EventKind::ConnectionError)
        .count();
    assert_eq!(connection_errors, 2);
}

#[cfg(unix)]
#[tokio::test]
async fn test_silent_child_fails_handshake_with_timeout() {
    let mut config = McpServerConfig::new("cat");
    config.timeout_ms = 200;
    config.max_retries = 0;
    let adapter = McpAdapter::new("echoer", config, EventBus::default());

    assert!(!adapter.validate().await);

    let err = adapter.execute("anything", json!({})).await.unwrap_err();
    assert_eq!(err.category, ErrorCategory::Timeout);
    adapter.close().await.unwrap();
}
