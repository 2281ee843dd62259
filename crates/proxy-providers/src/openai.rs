use proxy_core::message::{ChatRequest, Content, ResponseEnvelope, Role};
use proxy_core::Result;
use serde_json::json;

use crate::http_backend::ChatAdapter;
use crate::models::fallback_models;

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Adapter for any OpenAI-compatible `/chat/completions` endpoint (OpenAI
/// itself, OpenRouter, and self-hosted gateways that mirror the shape).
pub struct OpenAiCompatibleAdapter {
    base_url: String,
}

impl OpenAiCompatibleAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl ChatAdapter for OpenAiCompatibleAdapter {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint_path(&self) -> &str {
        "/chat/completions"
    }

    fn auth_header(&self, key: &str) -> (String, String) {
        ("Authorization".to_string(), format!("Bearer {key}"))
    }

    fn build_body(&self, request: &ChatRequest, effective_model: &str) -> serde_json::Value {
        let messages: Vec<_> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": role_str(m.role),
                    "content": m.content.as_text().unwrap_or_default(),
                })
            })
            .collect();
        let mut body = json!({
            "model": effective_model,
            "messages": messages,
            "stream": request.stream.unwrap_or(false),
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = request.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(tools) = &request.tools {
            body["tools"] = tools.clone();
        }
        if let Some(tool_choice) = &request.tool_choice {
            body["tool_choice"] = tool_choice.clone();
        }
        body
    }

    fn parse_response(&self, status: u16, body: serde_json::Value) -> Result<ResponseEnvelope> {
        Ok(ResponseEnvelope::NonStreaming {
            status,
            headers: Default::default(),
            body,
        })
    }

    fn default_models(&self) -> Vec<String> {
        fallback_models("openai")
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn stream_delta_fn(&self) -> fn(&serde_json::Value) -> Option<String> {
        openai_stream_delta
    }
}

/// Extracts `choices[0].delta.content` from one upstream SSE payload
/// (OpenAI-compatible streaming shape). Role-only deltas and tool-call
/// deltas carry no `content` and yield `None`.
fn openai_stream_delta(json: &serde_json::Value) -> Option<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[allow(dead_code)]
fn unused_content_variant_guard(_c: &Content) {}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_core::message::ChatMessage;
    use std::collections::HashMap;

    #[test]
    fn builds_messages_array_with_explicit_request_fields_preserved() {
        let adapter = OpenAiCompatibleAdapter::new("https://api.openai.com/v1");
        let request = ChatRequest {
            model: "gpt-4".to_string(),
            messages: vec![ChatMessage::user("hi")],
            stream: None,
            temperature: Some(0.2),
            top_p: None,
            max_tokens: None,
            tools: None,
            tool_choice: None,
            session_id: None,
            extra: HashMap::new(),
        };
        let body = adapter.build_body(&request, "gpt-4-turbo");
        assert_eq!(body["model"], "gpt-4-turbo");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["temperature"], 0.2);
    }

    #[test]
    fn stream_delta_extracts_content_and_skips_role_only_chunks() {
        let role_only = json!({"choices": [{"delta": {"role": "assistant"}}]});
        assert_eq!(openai_stream_delta(&role_only), None);

        let content = json!({"choices": [{"delta": {"content": "hel"}}]});
        assert_eq!(openai_stream_delta(&content), Some("hel".to_string()));
    }
}
