use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::instrument;

use crate::backend::BackendRegistry;
use crate::capture::{CaptureDirection, WireCapture};
use crate::command::{ApplicationState, CommandProcessor, CommandRegistry};
use crate::error::{ProxyError, Result};
use crate::failover::{build_attempts, Attempt, AttemptExecutor, FailoverCoordinator, KeyRegistry, RateLimiter};
use crate::message::{ChatMessage, ChatRequest, ResponseEnvelope};
use crate::middleware::{
    EditPrecisionMiddleware, JsonRepairMiddleware, LoopDetectionConfig, LoopDetectionMiddleware, MiddlewareChain,
    MiddlewareContext, PendingTuningStore, RedactionMirrorMiddleware, ToolCallLoopDetector, ToolLoopVerdict,
};
use crate::redaction::Redactor;
use crate::session::{
    InteractionHandler, RequestContext, SessionInteraction, SessionResolver, SessionState, SessionStore, ToolLoopMode,
};
use crate::stream::{decode_canonical_byte_stream, single_item_stream};

/// Temperature edit-precision tuning falls back to when a session has no
/// lower bound configured of its own (spec.md §4.9 middleware 2).
const DEFAULT_EDIT_PRECISION_TEMPERATURE: f32 = 0.15;

/// Everything the request processor needs besides the request itself
/// (spec.md §4.11 C11). One instance is shared across requests.
pub struct RequestProcessor {
    pub command_registry: CommandRegistry,
    pub command_processor: CommandProcessor,
    pub session_store: Arc<dyn SessionStore>,
    pub session_resolver: SessionResolver,
    pub backend_registry: Arc<BackendRegistry>,
    pub key_registry: KeyRegistry,
    pub rate_limiter: Arc<RateLimiter>,
    pub wire_capture: Arc<WireCapture>,
    pub default_backend: Option<String>,
    pub recovery_prompt: String,
    pub known_api_keys: Vec<String>,
    pub pending_tuning: Arc<PendingTuningStore>,
    pub tool_loop_detector: Arc<ToolCallLoopDetector>,
    pub json_repair_enabled: bool,
}

/// Reads `choices[0].message.tool_calls` out of a non-streaming body and
/// fingerprints each call as `name:canonicalized_args` (spec.md §4.9
/// "tool-call loop detection"). Canonicalizing re-parses the arguments JSON
/// so key order or whitespace differences don't defeat the fingerprint.
fn extract_tool_call_fingerprints(body: &Value) -> Vec<String> {
    let Some(calls) = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("tool_calls"))
        .and_then(|t| t.as_array())
    else {
        return Vec::new();
    };

    calls
        .iter()
        .filter_map(|call| {
            let function = call.get("function")?;
            let name = function.get("name")?.as_str()?;
            let args = function.get("arguments").and_then(|a| a.as_str()).unwrap_or("");
            let canonical = serde_json::from_str::<Value>(args)
                .map(|v| v.to_string())
                .unwrap_or_else(|_| args.to_string());
            Some(format!("{name}:{canonical}"))
        })
        .collect()
}

struct DispatchExecutor<'a> {
    backend_registry: &'a BackendRegistry,
    capture: &'a WireCapture,
    request: &'a ChatRequest,
    session_id: &'a str,
    agent: Option<&'a str>,
    client: &'a str,
}

#[async_trait]
impl<'a> AttemptExecutor for DispatchExecutor<'a> {
    async fn execute(&self, attempt: &Attempt) -> Result<ResponseEnvelope> {
        let body = serde_json::to_string(self.request).unwrap_or_default();
        self.capture
            .record(
                CaptureDirection::Outbound,
                self.client,
                self.agent,
                self.session_id,
                &attempt.backend,
                &attempt.model,
                Some(&attempt.key),
                &body,
            )
            .await;
        let result = self
            .backend_registry
            .dispatch(&attempt.backend, self.request, &attempt.model, &attempt.key)
            .await;
        if let Ok(ResponseEnvelope::NonStreaming { body, .. }) = &result {
            self.capture
                .record(
                    CaptureDirection::Inbound,
                    self.client,
                    self.agent,
                    self.session_id,
                    &attempt.backend,
                    &attempt.model,
                    Some(&attempt.key),
                    &body.to_string(),
                )
                .await;
        }
        result
    }
}

impl RequestProcessor {
    /// Resolves `(backend, model)` honoring oneoff, then a qualified model
    /// in the request, then the session override, then the app default
    /// (spec.md §4.11 step 6).
    fn resolve_backend_model<'a>(
        &'a self,
        request: &'a ChatRequest,
        state: &'a SessionState,
    ) -> (Option<&'a str>, &'a str) {
        if let Some(oneoff) = &state.backend_config.oneoff {
            return (Some(oneoff.backend.as_str()), oneoff.model.as_str());
        }
        if let Some((backend, model)) = request.qualified_backend() {
            return (Some(backend), model);
        }
        if let Some(backend) = &state.backend_config.backend_type {
            return (Some(backend.as_str()), request.model.as_str());
        }
        (self.default_backend.as_deref(), request.model.as_str())
    }

    fn synthetic_reply(
        &self,
        messages: &[String],
        state: &SessionState,
        app: &dyn ApplicationState,
        agent: Option<&str>,
    ) -> ResponseEnvelope {
        let mut text = messages.join(" ");
        if state.hello_requested {
            let banner = format!(
                "Hello! project={} v{} backends=[{}] prefix={}",
                app.project_name(),
                app.project_version(),
                app.functional_backends().join(", "),
                app.command_prefix()
            );
            text = format!("{banner}\n{text}").trim().to_string();
        }
        if agent == Some("cline") {
            text = format!("<attempt_completion><result>{text}</result></attempt_completion>");
        }
        ResponseEnvelope::json(
            200,
            json!({
                "id": "proxy_cmd_processed",
                "object": "chat.completion",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": text},
                    "finish_reason": "stop",
                }],
            }),
        )
    }

    fn response_text(envelope: &ResponseEnvelope) -> Option<String> {
        match envelope {
            ResponseEnvelope::NonStreaming { body, .. } => Self::content_from_body(body),
            ResponseEnvelope::Streaming { .. } => None,
        }
    }

    fn content_from_body(body: &Value) -> Option<String> {
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Substitutes `text` into the `choices[0].message.content` path of
    /// `body`, leaving the rest of the shape untouched. A no-op if the body
    /// doesn't carry that path (e.g. a backend-specific error body).
    fn with_replaced_content(body: &Value, text: &str) -> Value {
        let mut body = body.clone();
        if let Some(content) = body
            .get_mut("choices")
            .and_then(|c| c.get_mut(0))
            .and_then(|c| c.get_mut("message"))
            .and_then(|m| m.get_mut("content"))
        {
            *content = Value::String(text.to_string());
        }
        body
    }

    /// Drives the fixed ten-step pipeline from spec.md §4.11 for a single
    /// non-streaming request.
    #[instrument(skip(self, request, app), fields(session_id))]
    pub async fn process(
        &self,
        mut request: ChatRequest,
        mut ctx: RequestContext,
        app: &dyn ApplicationState,
        client: &str,
    ) -> Result<ResponseEnvelope> {
        let session_id = self.session_resolver.resolve(&mut ctx);
        tracing::Span::current().record("session_id", session_id.as_str());
        let mut session = self.session_store.get_or_create(&session_id).await;
        if let Some(agent) = &ctx.agent {
            session.agent = Some(agent.clone());
        }

        let (modified_messages, next_state, dispatch_result) = self.command_processor.process(
            &request.messages,
            &session.state,
            &self.command_registry,
            app,
        );
        session.state = next_state;
        request.messages = modified_messages;

        if dispatch_result.command_executed
            && !dispatch_result.any_result_carries_data()
            && dispatch_result
                .modified_messages
                .iter()
                .all(|m| m.content.is_empty())
        {
            let messages: Vec<String> = dispatch_result
                .command_results
                .iter()
                .map(|r| r.message.clone())
                .collect();
            let envelope = self.synthetic_reply(&messages, &session.state, app, session.agent.as_deref());

            session.state = session
                .state
                .with_hello_requested(false)
                .with_interactive_just_enabled(false);
            session.history.push(SessionInteraction {
                prompt: "(command only)".to_string(),
                handler: InteractionHandler::Proxy,
                backend: None,
                model: None,
                project: session.state.project.clone(),
                parameters: None,
                response: Self::response_text(&envelope),
                usage: None,
                timestamp: crate::session::now(),
            });
            self.session_store
                .update(session)
                .await
                .map_err(|e| ProxyError::Backend(e.to_string()))?;
            return Ok(envelope);
        }

        if self.pending_tuning.take_if_pending(session_id.as_str()) {
            let tuning = EditPrecisionMiddleware::tuning(DEFAULT_EDIT_PRECISION_TEMPERATURE, request.top_p, None);
            request.temperature = Some(tuning.temperature);
            request.top_p = tuning.top_p;
        } else if request.temperature.is_none() {
            request.temperature = session.state.reasoning_config.temperature;
        }

        let (backend_override, effective_model) = {
            let (b, m) = self.resolve_backend_model(&request, &session.state);
            (b.map(|s| s.to_string()), m.to_string())
        };
        let mut state_for_attempts = session.state.clone();
        if let Some(backend) = &backend_override {
            state_for_attempts = state_for_attempts.with_backend(Some(backend.clone()));
        }

        let redactor = Redactor::new(self.known_api_keys.clone(), &app.command_prefix());
        request.messages = redactor.redact_messages(&request.messages);

        if request.messages.iter().all(|m| m.content.is_empty()) {
            return Err(ProxyError::InvalidRequest {
                message: "messages is empty after command processing".to_string(),
                param: Some("messages".to_string()),
                code: Some("empty_messages".to_string()),
            });
        }

        let attempts = build_attempts(
            &effective_model,
            &state_for_attempts,
            self.default_backend.as_deref(),
            &self.key_registry,
        );
        let coordinator = FailoverCoordinator::new(&self.rate_limiter);
        let executor = DispatchExecutor {
            backend_registry: &self.backend_registry,
            capture: &self.wire_capture,
            request: &request,
            session_id: session_id.as_str(),
            agent: session.agent.as_deref(),
            client,
        };

        let envelope = coordinator.drive(&attempts, &executor).await?;
        session.state = session.state.without_oneoff();

        if session.state.loop_config.tool_loop_detection_enabled {
            if let ResponseEnvelope::NonStreaming { body, .. } = &envelope {
                let max_repeats = session.state.loop_config.tool_loop_max_repeats.unwrap_or(3);
                let ttl = Duration::from_secs(session.state.loop_config.tool_loop_ttl_seconds.unwrap_or(120) as u64);
                let mode = session.state.loop_config.tool_loop_mode.unwrap_or(ToolLoopMode::Break);
                for fingerprint in extract_tool_call_fingerprints(body) {
                    match self
                        .tool_loop_detector
                        .observe(session_id.as_str(), &fingerprint, max_repeats, ttl, mode)
                    {
                        ToolLoopVerdict::Break => return Err(ProxyError::LoopDetection),
                        ToolLoopVerdict::Warn => {
                            tracing::warn!(session_id = session_id.as_str(), %fingerprint, "tool call loop warning");
                        }
                        ToolLoopVerdict::Continue => {}
                    }
                }
            }
        }

        let mut middleware_ctx = MiddlewareContext {
            session_id: session_id.as_str().to_string(),
        };
        let mut chain = MiddlewareChain::new();
        chain.add(Box::new(LoopDetectionMiddleware::new(
            LoopDetectionConfig::default(),
            session.state.loop_config.loop_detection_enabled,
        )));
        chain.add(Box::new(EditPrecisionMiddleware::new(self.pending_tuning.clone())));
        chain.add(Box::new(JsonRepairMiddleware::new(self.json_repair_enabled)));
        chain.add(Box::new(RedactionMirrorMiddleware::new(Redactor::new(
            self.known_api_keys.clone(),
            &app.command_prefix(),
        ))));
        let envelope = self
            .run_through_chain(envelope, &chain, &mut middleware_ctx, &request, &attempts, &coordinator)
            .await?;

        session.history.push(SessionInteraction {
            prompt: request
                .messages
                .last()
                .and_then(|m| m.content.as_text())
                .unwrap_or_default()
                .to_string(),
            handler: InteractionHandler::Backend,
            backend: backend_override,
            model: Some(effective_model),
            project: session.state.project.clone(),
            parameters: request.temperature.map(|t| json!({"temperature": t})),
            response: Self::response_text(&envelope),
            usage: None,
            timestamp: crate::session::now(),
        });
        self.session_store
            .update(session)
            .await
            .map_err(|e| ProxyError::Backend(e.to_string()))?;

        Ok(envelope)
    }

    /// Feeds every normalized item of `envelope` through `chain` (spec.md
    /// §4.9, §4.11 step 9). Non-streaming replies run as a single-item
    /// stream; genuine `Streaming` envelopes are decoded from the canonical
    /// wire format and driven chunk by chunk, so a mid-stream abort (e.g.
    /// `LoopDetectionMiddleware`) stops consuming the upstream feed instead
    /// of running against an already-buffered reply. Always resolves to a
    /// `NonStreaming` envelope: the client-facing transport still collapses
    /// to a single SSE frame (proxy-service's `stream_single_envelope`).
    async fn drive_through_chain(
        &self,
        envelope: ResponseEnvelope,
        chain: &MiddlewareChain,
        ctx: &mut MiddlewareContext,
    ) -> Result<ResponseEnvelope> {
        match envelope {
            ResponseEnvelope::NonStreaming { status, headers, body } => {
                let text = Self::content_from_body(&body).unwrap_or_default();
                let mut stream = single_item_stream(text);
                let mut processed = String::new();
                while let Some(item) = stream.next().await {
                    processed = chain.apply(item?, ctx)?.content;
                }
                let body = Self::with_replaced_content(&body, &processed);
                Ok(ResponseEnvelope::NonStreaming { status, headers, body })
            }
            ResponseEnvelope::Streaming { chunks, .. } => {
                let mut stream = decode_canonical_byte_stream(chunks);
                let mut processed = String::new();
                while let Some(item) = stream.next().await {
                    let content = chain.apply(item?, ctx)?;
                    if !content.is_cancellation {
                        processed.push_str(&content.content);
                    }
                }
                Ok(ResponseEnvelope::json(
                    200,
                    json!({
                        "choices": [{
                            "index": 0,
                            "message": {"role": "assistant", "content": processed},
                            "finish_reason": "stop",
                        }],
                    }),
                ))
            }
        }
    }

    /// Runs `envelope` through the chain, retrying the backend call exactly
    /// once if the fully-processed content is empty (spec.md §4.10).
    async fn run_through_chain(
        &self,
        envelope: ResponseEnvelope,
        chain: &MiddlewareChain,
        ctx: &mut MiddlewareContext,
        original_request: &ChatRequest,
        attempts: &[Attempt],
        coordinator: &FailoverCoordinator<'_>,
    ) -> Result<ResponseEnvelope> {
        let processed = self.drive_through_chain(envelope, chain, ctx).await?;

        if !Self::response_text(&processed).unwrap_or_default().trim().is_empty() {
            return Ok(processed);
        }

        let mut retry_request = original_request.clone();
        retry_request
            .messages
            .push(ChatMessage::user(self.recovery_prompt.clone()));
        let retry_executor = DispatchExecutor {
            backend_registry: &self.backend_registry,
            capture: &self.wire_capture,
            request: &retry_request,
            session_id: ctx.session_id.as_str(),
            agent: None,
            client: "retry",
        };
        match coordinator.drive(attempts, &retry_executor).await {
            Ok(retry_envelope) => match self.drive_through_chain(retry_envelope, chain, ctx).await {
                Ok(retried) => Ok(retried),
                Err(_) => Ok(processed),
            },
            Err(_) => Ok(processed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, IdentityHeaders};
    use crate::command::{ArgValue, CommandHandler, HandlerOutcome};
    use crate::session::InMemorySessionStore;
    use std::collections::HashMap;

    struct FakeApp;
    impl ApplicationState for FakeApp {
        fn command_prefix(&self) -> String {
            "!/".to_string()
        }
        fn redaction_enabled(&self) -> bool {
            true
        }
        fn functional_backends(&self) -> Vec<String> {
            vec!["stub".to_string()]
        }
        fn project_name(&self) -> &str {
            "proxy"
        }
        fn project_version(&self) -> &str {
            "0.1.0"
        }
        fn thinking_budget_cli_override(&self) -> Option<u32> {
            None
        }
    }

    struct HelloStub;
    impl CommandHandler for HelloStub {
        fn name(&self) -> &str {
            "hello"
        }
        fn description(&self) -> &str {
            "test"
        }
        fn handle(
            &self,
            _args: &HashMap<String, ArgValue>,
            state: &SessionState,
            _app: &dyn ApplicationState,
        ) -> HandlerOutcome {
            HandlerOutcome::ok("Hello there", state.with_hello_requested(true))
        }
    }

    struct StubBackend;
    #[async_trait]
    impl Backend for StubBackend {
        fn name(&self) -> &str {
            "stub"
        }
        async fn initialize(&self, _config: &HashMap<String, String>) -> Result<()> {
            Ok(())
        }
        async fn chat_completions(
            &self,
            _request: &ChatRequest,
            _effective_model: &str,
            _key: &str,
            _identity: &IdentityHeaders,
        ) -> Result<ResponseEnvelope> {
            Ok(ResponseEnvelope::json(
                200,
                json!({"choices":[{"index":0,"message":{"role":"assistant","content":"ok"}}]}),
            ))
        }
        async fn get_available_models(&self) -> Result<Vec<String>> {
            Ok(vec!["m".to_string()])
        }
    }

    fn build_processor() -> RequestProcessor {
        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(HelloStub));

        let mut backend_registry = BackendRegistry::new(IdentityHeaders::default());
        backend_registry.register(Arc::new(StubBackend));

        let mut key_registry = KeyRegistry::new();
        key_registry.set_keys("stub", vec!["K1".to_string()]);

        RequestProcessor {
            command_registry: registry,
            command_processor: CommandProcessor::new("!/", crate::command::UnknownCommandPolicy::Drop),
            session_store: InMemorySessionStore::new(),
            session_resolver: SessionResolver::new("proxy"),
            backend_registry: Arc::new(backend_registry),
            key_registry,
            rate_limiter: Arc::new(RateLimiter::new(1000, std::time::Duration::from_secs(60))),
            wire_capture: Arc::new(futures::executor::block_on(WireCapture::new(
                crate::capture::CaptureConfig::default(),
            ))),
            default_backend: Some("stub".to_string()),
            recovery_prompt: "Please provide a response.".to_string(),
            known_api_keys: Vec::new(),
            pending_tuning: Arc::new(PendingTuningStore::new()),
            tool_loop_detector: Arc::new(ToolCallLoopDetector::new()),
            json_repair_enabled: false,
        }
    }

    #[tokio::test]
    async fn pure_command_returns_synthetic_reply_without_dispatch() {
        let processor = build_processor();
        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage::user("!/hello")],
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            tools: None,
            tool_choice: None,
            session_id: None,
            extra: HashMap::new(),
        };
        let envelope = processor
            .process(request, RequestContext::default(), &FakeApp, "1.2.3.4")
            .await
            .unwrap();
        match envelope {
            ResponseEnvelope::NonStreaming { body, .. } => {
                assert_eq!(body["id"], "proxy_cmd_processed");
                assert!(body["choices"][0]["message"]["content"]
                    .as_str()
                    .unwrap()
                    .contains("Hello"));
            }
            _ => panic!("expected non-streaming envelope"),
        }
    }

    #[tokio::test]
    async fn prompt_without_command_dispatches_to_backend() {
        let processor = build_processor();
        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage::user("hi there")],
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            tools: None,
            tool_choice: None,
            session_id: None,
            extra: HashMap::new(),
        };
        let envelope = processor
            .process(request, RequestContext::default(), &FakeApp, "1.2.3.4")
            .await
            .unwrap();
        match envelope {
            ResponseEnvelope::NonStreaming { body, .. } => {
                assert_eq!(body["choices"][0]["message"]["content"], "ok");
            }
            _ => panic!("expected non-streaming envelope"),
        }
    }

    #[tokio::test]
    async fn empty_messages_after_processing_is_rejected() {
        let processor = build_processor();
        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage::user("   ")],
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            tools: None,
            tool_choice: None,
            session_id: None,
            extra: HashMap::new(),
        };
        let result = processor
            .process(request, RequestContext::default(), &FakeApp, "1.2.3.4")
            .await;
        assert!(matches!(result, Err(ProxyError::InvalidRequest { .. })));
    }
}
