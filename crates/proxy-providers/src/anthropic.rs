use proxy_core::message::{ChatMessage, ChatRequest, Content, Role, ResponseEnvelope};
use proxy_core::{ProxyError, Result};
use serde_json::{json, Value};

use crate::http_backend::ChatAdapter;
use crate::models::fallback_models;

const ANTHROPIC_VERSION: &str = "2023-06-01";

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "user",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "user",
    }
}

/// Backend adapter for Anthropic's native Messages API (spec.md §4.7).
/// Anthropic moves the system prompt out of `messages` into a top-level
/// `system` field and authenticates with `x-api-key` rather than `Bearer`.
pub struct AnthropicAdapter {
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl ChatAdapter for AnthropicAdapter {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint_path(&self) -> &str {
        "/v1/messages"
    }

    fn auth_header(&self, key: &str) -> (String, String) {
        ("x-api-key".to_string(), key.to_string())
    }

    fn build_body(&self, request: &ChatRequest, effective_model: &str) -> Value {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for m in &request.messages {
            let text = m.content.as_text().unwrap_or_default().to_string();
            if matches!(m.role, Role::System) {
                system_parts.push(text);
                continue;
            }
            messages.push(json!({
                "role": role_str(m.role),
                "content": text,
            }));
        }

        let mut body = json!({
            "model": effective_model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(4096),
            "stream": request.stream.unwrap_or(false),
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = request.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(tools) = &request.tools {
            body["tools"] = tools.clone();
        }
        body
    }

    fn parse_response(&self, status: u16, body: Value) -> Result<ResponseEnvelope> {
        Ok(ResponseEnvelope::NonStreaming {
            status,
            headers: Default::default(),
            body: canonical_from_anthropic_body(body),
        })
    }

    fn default_models(&self) -> Vec<String> {
        fallback_models("anthropic")
    }
}

/// Anthropic-native reply body -> canonical OpenAI-shaped body, so the rest
/// of the pipeline (middleware chain, redaction mirror, synthetic replies)
/// never has to special-case the provider.
fn canonical_from_anthropic_body(body: Value) -> Value {
    let text = body["content"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p["type"] == "text")
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    json!({
        "id": body.get("id").cloned().unwrap_or(Value::Null),
        "object": "chat.completion",
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": body.get("stop_reason").cloned().unwrap_or(Value::Null),
        }],
        "usage": body.get("usage").cloned().unwrap_or(Value::Null),
    })
}

/// Parses an inbound `POST /anthropic/v1/messages` request body into the
/// pipeline's canonical `ChatRequest` (spec.md §6).
pub fn anthropic_request_to_canonical(body: &Value) -> Result<ChatRequest> {
    let model = body["model"]
        .as_str()
        .ok_or_else(|| ProxyError::InvalidRequest {
            message: "missing `model`".to_string(),
            param: Some("model".to_string()),
            code: Some("missing_field".to_string()),
        })?
        .to_string();

    let mut messages = Vec::new();
    if let Some(system) = body["system"].as_str() {
        messages.push(ChatMessage {
            role: Role::System,
            content: Content::Text(system.to_string()),
            tool_call_id: None,
            name: None,
        });
    }

    let raw_messages = body["messages"].as_array().ok_or_else(|| ProxyError::InvalidRequest {
        message: "missing `messages`".to_string(),
        param: Some("messages".to_string()),
        code: Some("missing_field".to_string()),
    })?;
    for m in raw_messages {
        let role = match m["role"].as_str() {
            Some("assistant") => Role::Assistant,
            _ => Role::User,
        };
        let text = match &m["content"] {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter(|p| p["type"] == "text")
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        };
        messages.push(ChatMessage {
            role,
            content: Content::Text(text),
            tool_call_id: None,
            name: None,
        });
    }

    Ok(ChatRequest {
        model,
        messages,
        stream: body["stream"].as_bool(),
        temperature: body["temperature"].as_f64().map(|v| v as f32),
        top_p: body["top_p"].as_f64().map(|v| v as f32),
        max_tokens: body["max_tokens"].as_u64().map(|v| v as u32),
        tools: body.get("tools").cloned(),
        tool_choice: None,
        session_id: None,
        extra: Default::default(),
    })
}

/// Converts a canonical (OpenAI-shaped) non-streaming reply body back into
/// Anthropic's Messages API response shape, for `POST /anthropic/v1/messages`
/// callers (spec.md §8: "round-trip ... up to field-set preservation").
pub fn canonical_response_to_anthropic(body: &Value) -> Value {
    let choice = &body["choices"][0];
    let text = choice["message"]["content"].as_str().unwrap_or_default();
    json!({
        "id": body.get("id").cloned().unwrap_or(Value::Null),
        "type": "message",
        "role": "assistant",
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "content": [{"type": "text", "text": text}],
        "stop_reason": choice.get("finish_reason").cloned().unwrap_or(Value::Null),
        "usage": body.get("usage").cloned().unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_is_lifted_out_of_the_messages_array() {
        let adapter = AnthropicAdapter::new("https://api.anthropic.com");
        let request = ChatRequest {
            model: "claude-opus-4-1".to_string(),
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: Content::Text("be terse".to_string()),
                    tool_call_id: None,
                    name: None,
                },
                ChatMessage::user("hi"),
            ],
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            tools: None,
            tool_choice: None,
            session_id: None,
            extra: Default::default(),
        };
        let body = adapter.build_body(&request, "claude-opus-4-1");
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn round_trips_a_canonical_reply_through_anthropic_shape_and_back() {
        let canonical = json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "claude-opus-4-1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello there"},
                "finish_reason": "stop",
            }],
            "usage": {"total_tokens": 5},
        });
        let anthropic_shaped = canonical_response_to_anthropic(&canonical);
        assert_eq!(anthropic_shaped["content"][0]["text"], "hello there");

        let back = canonical_from_anthropic_body(json!({
            "id": "msg_1",
            "model": "claude-opus-4-1",
            "content": [{"type": "text", "text": "hello there"}],
            "stop_reason": "end_turn",
            "usage": {"total_tokens": 5},
        }));
        assert_eq!(back["choices"][0]["message"]["content"], "hello there");
    }

    #[test]
    fn request_conversion_requires_model_and_messages() {
        let err = anthropic_request_to_canonical(&json!({"messages": []})).unwrap_err();
        matches!(err, ProxyError::InvalidRequest { .. });
    }
}
