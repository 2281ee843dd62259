mod auth;
mod config;
mod state;

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures::stream as futures_stream;
use proxy_core::backend::{Backend, BackendRegistry, IdentityHeaders};
use proxy_core::capture::{CaptureConfig, WireCapture};
use proxy_core::command::{
    register_builtin_handlers, ApplicationState, CommandProcessor, CommandRegistry, UnknownCommandPolicy,
};
use proxy_core::failover::{KeyRegistry, RateLimiter};
use proxy_core::message::{ChatRequest, ResponseEnvelope};
use proxy_core::middleware::{PendingTuningStore, ToolCallLoopDetector};
use proxy_core::session::{InMemorySessionStore, RequestContext, SessionResolver};
use proxy_core::RequestProcessor;
use proxy_providers::{AnthropicAdapter, HttpBackend, OpenAiCompatibleAdapter};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{env_api_keys, resolve_config, Args};
use crate::state::ServiceState;

#[derive(Clone)]
pub struct AppState {
    state: Arc<ServiceState>,
    processor: Arc<RequestProcessor>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("proxy_service=info,tower_http=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let args = Args::parse();
    let config = resolve_config(&args)?;

    let mut backend_registry = BackendRegistry::new(IdentityHeaders {
        http_referer: Some("https://github.com/example/llm-reverse-proxy".to_string()),
        x_title: Some("llm-reverse-proxy".to_string()),
    });
    let mut key_registry = KeyRegistry::new();

    for (name, entry) in &config.backends {
        let mut keys = entry.keys.clone();
        keys.extend(env_api_keys(name));
        if keys.is_empty() {
            warn!(backend = %name, "no API keys configured; backend will fail every dispatch");
        }
        key_registry.set_keys(name, keys);
        register_backend(&mut backend_registry, name, &entry.kind, &entry.base_url);
    }

    let functional_backends = backend_registry.functional_backends();
    info!(addr = %config.addr, backends = ?functional_backends, auth = %(!config.disable_auth), "starting service");

    let mut command_registry = CommandRegistry::new();
    if !config.disable_commands {
        register_builtin_handlers(&mut command_registry);
    }

    let unknown_policy = UnknownCommandPolicy::Preserve;
    let command_processor = CommandProcessor::new(config.command_prefix.clone(), unknown_policy);

    let wire_capture = WireCapture::new(CaptureConfig {
        file: config.capture_file.clone(),
        max_bytes: config.capture_max_bytes,
        max_files: config.capture_max_files,
        total_max_bytes: config.capture_total_max_bytes,
        truncate_bytes: config.capture_truncate_bytes,
    })
    .await;

    let processor = RequestProcessor {
        command_registry,
        command_processor,
        session_store: InMemorySessionStore::new(),
        session_resolver: SessionResolver::new("proxy"),
        backend_registry: Arc::new(backend_registry),
        key_registry,
        rate_limiter: Arc::new(RateLimiter::new(60, std::time::Duration::from_secs(60))),
        wire_capture: Arc::new(wire_capture),
        default_backend: config.default_backend.clone(),
        recovery_prompt: config.recovery_prompt.clone(),
        known_api_keys: config
            .backends
            .values()
            .flat_map(|b| b.keys.clone())
            .collect(),
        pending_tuning: Arc::new(PendingTuningStore::new()),
        tool_loop_detector: Arc::new(ToolCallLoopDetector::new()),
        json_repair_enabled: config.json_repair_enabled,
    };

    let app_state = AppState {
        state: Arc::new(ServiceState::new(config.clone(), functional_backends, args.config.clone())),
        processor: Arc::new(processor),
    };

    let app = Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/models", get(handle_models))
        .route("/v1/models", get(handle_models))
        .route("/anthropic/v1/messages", post(handle_anthropic_messages))
        .layer(middleware::from_fn_with_state(app_state.clone(), auth::require_bearer_auth))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr: SocketAddr = config.addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

fn register_backend(registry: &mut BackendRegistry, name: &str, kind: &str, base_url: &str) {
    match kind {
        "anthropic" => registry.register(Arc::new(HttpBackend::new(name, AnthropicAdapter::new(base_url)))),
        _ => registry.register(Arc::new(HttpBackend::new(name, OpenAiCompatibleAdapter::new(base_url)))),
    }
}

fn request_context_from_headers(headers: &HeaderMap, request: &ChatRequest) -> RequestContext {
    RequestContext {
        session_id_field: request.session_id.clone(),
        extra_session_id: request
            .extra
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        header_session_id: headers
            .get("x-session-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        cookie_session_id: headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .and_then(extract_session_cookie),
        generated_session_id: None,
        agent: headers
            .get("x-agent")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        extra: HashMap::new(),
    }
}

fn extract_session_cookie(cookie_header: &str) -> Option<String> {
    cookie_header
        .split(';')
        .map(str::trim)
        .find_map(|pair| pair.strip_prefix("session_id=").map(|v| v.to_string()))
}

fn error_response(status: StatusCode, error_type: &str, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": {"message": message.into(), "type": error_type}}))).into_response()
}

fn proxy_error_response(err: proxy_core::ProxyError) -> Response {
    use proxy_core::ProxyError;
    match err {
        ProxyError::InvalidRequest { message, param, code } => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"message": message, "type": "invalid_request_error", "param": param, "code": code}})),
        )
            .into_response(),
        ProxyError::LoopDetection => error_response(StatusCode::BAD_REQUEST, "loop_detection_error", "response loop detected"),
        ProxyError::RateLimit { retry_after } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": {"message": "rate limited", "type": "rate_limit_error", "retry_after": retry_after}})),
        )
            .into_response(),
        ProxyError::Backend(msg) => {
            error!(error = %msg, "backend exhausted");
            error_response(StatusCode::BAD_GATEWAY, "backend_error", "all backend attempts failed")
        }
        ProxyError::Capacity(msg) | ProxyError::Initialization(msg) => {
            error!(error = %msg, "internal failure");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal server error")
        }
        other => {
            error!(error = %other, "unhandled error");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal server error")
        }
    }
}

async fn handle_chat_completions(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let wants_stream = request.stream.unwrap_or(false);
    let ctx = request_context_from_headers(&headers, &request);
    let client = addr.ip().to_string();

    let result = app.processor.process(request, ctx, app.state.as_ref(), &client).await;
    match result {
        Ok(envelope) if wants_stream => stream_single_envelope(envelope).into_response(),
        Ok(ResponseEnvelope::NonStreaming { status, body, .. }) => {
            (StatusCode::from_u16(status).unwrap_or(StatusCode::OK), Json(body)).into_response()
        }
        Ok(ResponseEnvelope::Streaming { .. }) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "unexpected stream envelope")
        }
        Err(err) => proxy_error_response(err),
    }
}

/// Every reply the core produces today is non-streaming; when the caller
/// asked for `stream: true` we still honor the request shape by emitting it
/// as a single SSE frame followed by `[DONE]` (spec.md §4.9 "non-streaming
/// responses are treated as single-item streams").
fn stream_single_envelope(envelope: ResponseEnvelope) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let body = match envelope {
        ResponseEnvelope::NonStreaming { body, .. } => body,
        ResponseEnvelope::Streaming { .. } => Value::Null,
    };
    let events = vec![
        Ok(Event::default().data(body.to_string())),
        Ok(Event::default().data("[DONE]")),
    ];
    Sse::new(futures_stream::iter(events)).keep_alive(KeepAlive::default())
}

async fn handle_models(State(app): State<AppState>) -> Json<Value> {
    let config = app.state.snapshot();
    let mut data = Vec::new();
    for backend in app.state.functional_backends() {
        let models = match app.processor.backend_registry.get(&backend) {
            Some(adapter) => match adapter.get_available_models().await {
                Ok(models) => models,
                Err(err) => {
                    let kind = config.backends.get(&backend).map(|e| e.kind.as_str()).unwrap_or(&backend);
                    warn!(backend = %backend, error = %err, "get_available_models failed; using fallback list");
                    proxy_providers::fallback_models(kind)
                }
            },
            None => continue,
        };
        for model in models {
            data.push(json!({"id": format!("{backend}:{model}"), "object": "model", "owned_by": backend}));
        }
    }
    Json(json!({"object": "list", "data": data}))
}

async fn handle_anthropic_messages(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request = match proxy_providers::anthropic_request_to_canonical(&body) {
        Ok(r) => r,
        Err(err) => return proxy_error_response(err),
    };
    let wants_stream = request.stream.unwrap_or(false);
    let ctx = request_context_from_headers(&headers, &request);
    let client = addr.ip().to_string();

    match app.processor.process(request, ctx, app.state.as_ref(), &client).await {
        Ok(ResponseEnvelope::NonStreaming { body, .. }) => {
            let anthropic_body = proxy_providers::canonical_response_to_anthropic(&body);
            if wants_stream {
                stream_single_envelope(ResponseEnvelope::json(200, anthropic_body)).into_response()
            } else {
                Json(anthropic_body).into_response()
            }
        }
        Ok(ResponseEnvelope::Streaming { .. }) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "unexpected stream envelope")
        }
        Err(err) => proxy_error_response(err),
    }
}
