//! Call dispatcher.
//!
//! Routes a qualified `source__tool` id to its adapter, runs the adapter's
//! `execute` under the retry engine and reports the call lifecycle on the
//! event bus. Every failure leaves here as a [`RuntimeError`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::adapter::{AdapterRegistry, SourceAdapter, ToolDefinition};
use crate::errors::{codes, Result, RuntimeError};
use crate::events::{EventBus, EventKind, Logger, TracingLogger};
use crate::retry::{retry_with_backoff, RetryOverride, RetryPolicy};
use crate::schema;

/// Separator between source and tool in a qualified id.
pub const TOOL_ID_SEPARATOR: &str = "__";

// ─── ToolId ──────────────────────────────────────────────────────────────────

/// A parsed `source__tool` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolId {
    pub source: String,
    pub tool: String,
}

impl ToolId {
    /// Parse a qualified id. Exactly one `__` with a non-empty part on each
    /// side; anything else is a CONFIG error.
    pub fn parse(id: &str) -> Result<Self> {
        let parts: Vec<&str> = id.split(TOOL_ID_SEPARATOR).collect();
        match parts.as_slice() {
            [source, tool] if !source.is_empty() && !tool.is_empty() => Ok(Self {
                source: (*source).to_string(),
                tool: (*tool).to_string(),
            }),
            _ => Err(RuntimeError::config(format!(
                "invalid tool id '{id}': expected '<source>{TOOL_ID_SEPARATOR}<tool>'"
            ))
            .with_code(codes::INVALID_TOOL_ID)
            .with_context(json!({ "toolId": id }))),
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.source, TOOL_ID_SEPARATOR, self.tool)
    }
}

// ─── CallOptions ─────────────────────────────────────────────────────────────

/// Per-call knobs. The default runs with the dispatcher's policy and full
/// instrumentation.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Shallow override of the dispatcher's retry policy.
    pub retry: Option<RetryOverride>,
    /// Suppress `call:*` events for this call.
    pub skip_instrumentation: bool,
    /// Upper bound for each attempt.
    pub timeout: Option<Duration>,
    /// Raw JSON Schema the params must satisfy before dispatch.
    pub validate_input: Option<Value>,
}

impl CallOptions {
    pub fn with_retry(mut self, retry: RetryOverride) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.validate_input = Some(schema);
        self
    }

    pub fn without_instrumentation(mut self) -> Self {
        self.skip_instrumentation = true;
        self
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

pub struct Dispatcher {
    registry: Arc<AdapterRegistry>,
    events: EventBus,
    policy: RetryPolicy,
    logger: Arc<dyn Logger>,
}

impl Dispatcher {
    pub fn new(registry: Arc<AdapterRegistry>, events: EventBus) -> Self {
        Self {
            registry,
            events,
            policy: RetryPolicy::default(),
            logger: Arc::new(TracingLogger),
        }
    }

    /// Replace the base retry policy used when a call has no override.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call a tool with default options.
    pub async fn call(&self, tool_id: &str, params: Value) -> Result<Value> {
        self.call_with(tool_id, params, &CallOptions::default()).await
    }

    /// Call a tool.
    ///
    /// Malformed ids and unknown sources fail before any adapter is touched.
    pub async fn call_with(&self, tool_id: &str, params: Value, options: &CallOptions) -> Result<Value> {
        let id = ToolId::parse(tool_id)?;
        let adapter = self.adapter_for(&id)?;

        if let Some(raw) = &options.validate_input {
            schema::validate_raw(&params, raw)
                .map_err(|e| e.with_context(json!({ "toolId": tool_id })))?;
        }

        let policy = match &options.retry {
            Some(overrides) => self.policy.merged(overrides),
            None => self.policy.clone(),
        };
        let instrument = !options.skip_instrumentation;
        let call_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        if instrument {
            self.events.emit(
                EventKind::CallStart,
                json!({ "callId": call_id, "toolId": tool_id, "source": id.source, "tool": id.tool }),
            );
        }
        tracing::debug!(call_id = %call_id, tool_id = %tool_id, "dispatching call");

        let mut retries = 0u32;
        let outcome = retry_with_backoff(
            |attempt| {
                let adapter = Arc::clone(&adapter);
                let tool = id.tool.clone();
                let params = params.clone();
                let timeout = options.timeout;
                async move {
                    tracing::trace!(tool = %tool, attempt, "executing attempt");
                    execute_attempt(adapter.as_ref(), &tool, params, timeout).await
                }
            },
            &policy,
            |notice| {
                retries += 1;
                if instrument {
                    self.events.emit(
                        EventKind::CallRetry,
                        json!({
                            "callId": call_id,
                            "toolId": tool_id,
                            "attempt": notice.attempt,
                            "delayMs": notice.delay.as_millis() as u64,
                            "error": notice.error.to_json(),
                        }),
                    );
                }
            },
        )
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let attempts = retries + 1;
        match outcome {
            Ok(value) => {
                if instrument {
                    self.events.emit(
                        EventKind::CallSuccess,
                        json!({ "callId": call_id, "toolId": tool_id, "elapsedMs": elapsed_ms, "attempts": attempts }),
                    );
                }
                tracing::debug!(call_id = %call_id, tool_id = %tool_id, elapsed_ms, attempts, "call succeeded");
                Ok(value)
            }
            Err(error) => {
                let error = error.with_context(json!({ "toolId": tool_id }));
                if instrument {
                    self.events.emit(
                        EventKind::CallError,
                        json!({
                            "callId": call_id,
                            "toolId": tool_id,
                            "elapsedMs": elapsed_ms,
                            "attempts": attempts,
                            "error": error.to_json(),
                        }),
                    );
                }
                self.logger.warn(
                    &format!("call to {tool_id} failed after {attempts} attempt(s): {error}"),
                    error.context.as_ref(),
                );
                Err(error)
            }
        }
    }

    /// [`call_with`](Self::call_with) with serde-typed input and output.
    ///
    /// Input that cannot be serialized, or a result that does not fit `O`,
    /// is a VALIDATION error.
    pub async fn call_typed<I, O>(&self, tool_id: &str, input: &I, options: &CallOptions) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let params = serde_json::to_value(input).map_err(|e| {
            RuntimeError::validation(format!("cannot serialize input for {tool_id}: {e}")).with_cause(e)
        })?;
        let result = self.call_with(tool_id, params, options).await?;
        serde_json::from_value(result).map_err(|e| {
            RuntimeError::validation(format!("unexpected result shape from {tool_id}: {e}"))
                .with_context(json!({ "toolId": tool_id }))
                .with_cause(e)
        })
    }

    /// Discover every registered source concurrently.
    ///
    /// A source whose discovery fails is logged and reported with an empty
    /// tool list; the others are unaffected.
    pub async fn discover_all(&self) -> BTreeMap<String, Vec<ToolDefinition>> {
        let entries = self.registry.entries();
        let results = futures::future::join_all(entries.into_iter().map(|(name, adapter)| async move {
            let tools = adapter.discover().await;
            (name, tools)
        }))
        .await;

        results
            .into_iter()
            .map(|(name, tools)| match tools {
                Ok(tools) => {
                    tracing::debug!(source = %name, count = tools.len(), "discovery finished");
                    (name, tools)
                }
                Err(e) => {
                    self.logger.warn(
                        &format!("discovery failed for source '{name}': {e}"),
                        Some(&e.to_json()),
                    );
                    (name, Vec::new())
                }
            })
            .collect()
    }

    /// Close every registered adapter.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }

    fn adapter_for(&self, id: &ToolId) -> Result<Arc<dyn SourceAdapter>> {
        self.registry.get(&id.source).ok_or_else(|| {
            RuntimeError::config(format!("no adapter registered for source '{}'", id.source))
                .with_code(codes::ADAPTER_NOT_FOUND)
                .with_context(json!({
                    "source": id.source,
                    "available": self.registry.source_names(),
                }))
        })
    }
}

async fn execute_attempt(
    adapter: &dyn SourceAdapter,
    tool: &str,
    params: Value,
    timeout: Option<Duration>,
) -> Result<Value> {
    let Some(limit) = timeout else {
        return adapter.execute(tool, params).await;
    };
    match tokio::time::timeout(limit, adapter.execute(tool, params)).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::timeout(format!(
            "tool '{tool}' did not finish within {}ms",
            limit.as_millis()
        ))
        .with_context(json!({ "tool": tool, "timeoutMs": limit.as_millis() as u64 }))),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use serde::Deserialize;

    use crate::adapter::tests::StubAdapter;
    use crate::errors::ErrorCategory;
    use crate::events::RuntimeEvent;

    /// Adapter whose discovery fails and whose execution is slow.
    struct SluggishAdapter {
        delay: Duration,
    }

    #[async_trait]
    impl SourceAdapter for SluggishAdapter {
        fn kind(&self) -> &'static str {
            "sluggish"
        }

        async fn discover(&self) -> Result<Vec<ToolDefinition>> {
            Err(RuntimeError::discovery("backend unavailable"))
        }

        async fn execute(&self, _tool: &str, _params: Value) -> Result<Value> {
            tokio::time::sleep(self.delay).await;
            Ok(Value::Null)
        }

        async fn validate(&self) -> bool {
            false
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    fn dispatcher_with(adapter: Arc<dyn SourceAdapter>) -> Dispatcher {
        let registry = Arc::new(AdapterRegistry::new());
        registry.register_adapter("svc", adapter);
        Dispatcher::new(registry, EventBus::default()).with_policy(fast_policy())
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_parse_tool_id() {
        let id = ToolId::parse("github__create_issue").unwrap();
        assert_eq!(id.source, "github");
        assert_eq!(id.tool, "create_issue");
        assert_eq!(id.to_string(), "github__create_issue");
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        for bad in ["plain", "a__b__c", "__tool", "source__", "", "a____b"] {
            let err = ToolId::parse(bad).unwrap_err();
            assert_eq!(err.category, ErrorCategory::Config, "{bad}");
            assert_eq!(err.code, codes::INVALID_TOOL_ID, "{bad}");
        }
    }

    #[tokio::test]
    async fn test_malformed_id_never_touches_adapter() {
        let stub = Arc::new(StubAdapter::default());
        let dispatcher = dispatcher_with(stub.clone());

        let err = dispatcher.call("svc__a__b", json!({})).await.unwrap_err();

        assert_eq!(err.category, ErrorCategory::Config);
        assert_eq!(stub.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_source_is_config_error() {
        let dispatcher = dispatcher_with(Arc::new(StubAdapter::default()));
        let err = dispatcher.call("nope__echo", json!({})).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Config);
        assert_eq!(err.code, codes::ADAPTER_NOT_FOUND);
        assert_eq!(err.context.unwrap()["available"], json!(["svc"]));
    }

    #[tokio::test]
    async fn test_call_success_emits_start_and_success() {
        let dispatcher = dispatcher_with(Arc::new(StubAdapter::default()));
        let mut rx = dispatcher.events().subscribe();

        let result = dispatcher.call("svc__echo", json!({"x": 1})).await.unwrap();
        assert_eq!(result, json!({"tool": "echo", "params": {"x": 1}}));

        let events = drain(&mut rx);
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::CallStart, EventKind::CallSuccess]);
        assert_eq!(events[0].data["callId"], events[1].data["callId"]);
        assert_eq!(events[1].data["attempts"], 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let stub = Arc::new(StubAdapter::failing_with(vec![RuntimeError::transport("reset")]));
        let dispatcher = dispatcher_with(stub.clone());
        let mut rx = dispatcher.events().subscribe();

        dispatcher.call("svc__echo", json!({})).await.unwrap();

        assert_eq!(stub.executions.load(Ordering::SeqCst), 2);
        let kinds: Vec<EventKind> = drain(&mut rx).iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::CallStart, EventKind::CallRetry, EventKind::CallSuccess]
        );
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let stub = Arc::new(StubAdapter::failing_with(vec![RuntimeError::auth("bad token")]));
        let dispatcher = dispatcher_with(stub.clone());
        let mut rx = dispatcher.events().subscribe();

        let err = dispatcher.call("svc__echo", json!({})).await.unwrap_err();

        assert_eq!(err.category, ErrorCategory::Auth);
        assert_eq!(err.context.unwrap()["toolId"], "svc__echo");
        assert_eq!(stub.executions.load(Ordering::SeqCst), 1);
        let kinds: Vec<EventKind> = drain(&mut rx).iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::CallStart, EventKind::CallError]);
    }

    #[tokio::test]
    async fn test_retry_override_limits_attempts() {
        let stub = Arc::new(StubAdapter::failing_with(vec![
            RuntimeError::transport("first"),
            RuntimeError::transport("second"),
            RuntimeError::transport("third"),
        ]));
        let dispatcher = dispatcher_with(stub.clone());
        let options = CallOptions::default().with_retry(RetryOverride {
            max_attempts: Some(2),
            ..RetryOverride::default()
        });

        let err = dispatcher.call_with("svc__echo", json!({}), &options).await.unwrap_err();

        assert_eq!(err.message, "second");
        assert_eq!(stub.executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_skip_instrumentation_emits_nothing() {
        let dispatcher = dispatcher_with(Arc::new(StubAdapter::default()));
        let mut rx = dispatcher.events().subscribe();

        let options = CallOptions::default().without_instrumentation();
        dispatcher.call_with("svc__echo", json!({}), &options).await.unwrap();

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_input_validation_runs_before_dispatch() {
        let stub = Arc::new(StubAdapter::default());
        let dispatcher = dispatcher_with(stub.clone());
        let options = CallOptions::default().with_input_schema(json!({
            "properties": { "name": { "type": "string" } },
            "required": ["name"]
        }));

        let err = dispatcher.call_with("svc__echo", json!({}), &options).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(err.message.contains("name"));
        assert_eq!(stub.executions.load(Ordering::SeqCst), 0);

        dispatcher
            .call_with("svc__echo", json!({"name": "x"}), &options)
            .await
            .unwrap();
        assert_eq!(stub.executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let dispatcher = dispatcher_with(Arc::new(SluggishAdapter {
            delay: Duration::from_secs(5),
        }));
        let options = CallOptions::default()
            .with_timeout(Duration::from_millis(20))
            .with_retry(RetryOverride {
                max_attempts: Some(1),
                ..RetryOverride::default()
            });

        let err = dispatcher.call_with("svc__slow", json!({}), &options).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert!(err.retryable);
    }

    #[derive(Debug, Serialize)]
    struct EchoInput {
        text: String,
    }

    #[derive(Debug, Deserialize)]
    struct EchoOutput {
        tool: String,
        params: serde_json::Map<String, Value>,
    }

    #[tokio::test]
    async fn test_call_typed_round_trips_through_serde() {
        let dispatcher = dispatcher_with(Arc::new(StubAdapter::default()));
        let out: EchoOutput = dispatcher
            .call_typed(
                "svc__echo",
                &EchoInput { text: "hi".into() },
                &CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(out.tool, "echo");
        assert_eq!(out.params["text"], "hi");

        let err = dispatcher
            .call_typed::<_, Vec<u32>>("svc__echo", &json!({}), &CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
    }

    #[tokio::test]
    async fn test_discover_all_degrades_failing_source() {
        let registry = Arc::new(AdapterRegistry::new());
        registry.register_adapter("good", Arc::new(StubAdapter::default()));
        registry.register_adapter(
            "bad",
            Arc::new(SluggishAdapter {
                delay: Duration::ZERO,
            }),
        );
        let dispatcher = Dispatcher::new(registry, EventBus::default());

        let catalog = dispatcher.discover_all().await;

        assert_eq!(catalog.len(), 2);
        assert!(catalog["bad"].is_empty());
        assert_eq!(catalog["good"][0].name, "echo");
    }

    #[tokio::test]
    async fn test_shutdown_closes_adapters() {
        let stub = Arc::new(StubAdapter::default());
        let dispatcher = dispatcher_with(stub.clone());
        dispatcher.shutdown().await;
        assert_eq!(stub.closes.load(Ordering::SeqCst), 1);
        assert!(dispatcher.registry().is_empty());
    }
}
