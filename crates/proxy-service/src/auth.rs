use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::AppState;

/// Bearer-token auth gate (spec.md §6). A no-op when auth is disabled or no
/// keys are configured; otherwise requires an exact `Authorization: Bearer
/// <key>` match against the configured key list.
pub async fn require_bearer_auth(State(app): State<AppState>, request: Request, next: Next) -> Response {
    let config = app.state.snapshot();
    if config.disable_auth || config.auth_keys.is_empty() {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(key) if config.auth_keys.iter().any(|k| k == key) => next.run(request).await,
        _ => unauthorized(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"message": "invalid or missing API key", "type": "authentication_error"}})),
    )
        .into_response()
}
