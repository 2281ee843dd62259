use std::collections::{HashMap, VecDeque};
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use proxy_core::backend::{Backend, IdentityHeaders};
use proxy_core::message::{ByteStream, ChatRequest, ResponseEnvelope};
use proxy_core::stream::StreamingContent;
use proxy_core::{ProxyError, Result};

/// Translates between the canonical `ChatRequest`/`ResponseEnvelope` shapes
/// and a concrete provider's wire format (spec.md §4.7 "backend adapter"),
/// grounded in the teacher's `HTTPChatProvider` split of request-building
/// from response-parsing.
pub trait ChatAdapter: Send + Sync {
    fn base_url(&self) -> &str;

    /// Builds the provider-specific JSON body and path suffix for a chat
    /// completion call.
    fn build_body(&self, request: &ChatRequest, effective_model: &str) -> serde_json::Value;
    fn endpoint_path(&self) -> &str;
    fn auth_header(&self, key: &str) -> (String, String);

    fn parse_response(&self, status: u16, body: serde_json::Value) -> Result<ResponseEnvelope>;
    fn default_models(&self) -> Vec<String>;

    /// Whether this adapter can decode the provider's real upstream SSE
    /// framing (spec.md §4.9 C10 "each yielded item is processed
    /// immediately"). Adapters without a `stream_delta_fn` fall back to the
    /// non-streaming path even when the caller asked for `stream: true`.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Extracts the incremental text of one upstream SSE payload, or `None`
    /// for a role-only/content-less delta. A bare function pointer (not a
    /// closure) so it stays `'static` inside the boxed response stream.
    fn stream_delta_fn(&self) -> fn(&serde_json::Value) -> Option<String> {
        |_| None
    }
}

/// A `Backend` implementation shared by every HTTP-based adapter: build the
/// request via `ChatAdapter`, execute with `reqwest`, parse the reply.
pub struct HttpBackend<A: ChatAdapter> {
    name: String,
    adapter: A,
    client: reqwest::Client,
}

impl<A: ChatAdapter> HttpBackend<A> {
    pub fn new(name: impl Into<String>, adapter: A) -> Self {
        Self {
            name: name.into(),
            adapter,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl<A: ChatAdapter> Backend for HttpBackend<A> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, _config: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    async fn chat_completions(
        &self,
        request: &ChatRequest,
        effective_model: &str,
        key: &str,
        identity: &IdentityHeaders,
    ) -> Result<ResponseEnvelope> {
        let body = self.adapter.build_body(request, effective_model);
        let url = format!("{}{}", self.adapter.base_url(), self.adapter.endpoint_path());
        let (header_name, header_value) = self.adapter.auth_header(key);
        let wants_stream = request.stream.unwrap_or(false) && self.adapter.supports_streaming();

        let mut builder = self.client.post(&url).header(header_name, header_value).json(&body);
        for (name, value) in identity.as_header_map() {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProxyError::Backend(format!("{} request failed: {e}", self.name)))?;
        let status = response.status().as_u16();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(ProxyError::RateLimit { retry_after });
        }

        if wants_stream {
            if !(200..300).contains(&status) {
                let text = response.text().await.unwrap_or_default();
                return Err(ProxyError::Backend(format!("{} returned HTTP {status}: {text}", self.name)));
            }
            let chunks = canonicalize_sse(response.bytes_stream(), self.adapter.stream_delta_fn(), self.name.clone());
            return Ok(ResponseEnvelope::Streaming {
                media_type: "text/event-stream",
                chunks,
            });
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProxyError::Backend(format!("{} returned non-JSON body: {e}", self.name)))?;

        if !(200..300).contains(&status) {
            return Err(ProxyError::Backend(format!(
                "{} returned HTTP {status}: {parsed}",
                self.name
            )));
        }

        self.adapter.parse_response(status, parsed)
    }

    async fn get_available_models(&self) -> Result<Vec<String>> {
        Ok(self.adapter.default_models())
    }
}

fn encode_line(content: &StreamingContent) -> std::result::Result<bytes::Bytes, ProxyError> {
    let mut line = serde_json::to_vec(content)?;
    line.push(b'\n');
    Ok(bytes::Bytes::from(line))
}

/// Decodes a provider's raw `text/event-stream` byte feed into the
/// canonical newline-delimited-JSON `ByteStream` that
/// `proxy_core::stream::decode_canonical_byte_stream` expects on the other
/// end (spec.md §4.7, §4.9 — the adapter owns wire framing, the core only
/// ever sees the canonical shape). Never buffers more than the current
/// incomplete SSE line.
fn canonicalize_sse<S>(upstream: S, delta_fn: fn(&serde_json::Value) -> Option<String>, backend_name: String) -> ByteStream
where
    S: Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
{
    struct State<S> {
        upstream: Pin<Box<S>>,
        buffer: Vec<u8>,
        pending: VecDeque<std::result::Result<bytes::Bytes, ProxyError>>,
        finished: bool,
        backend_name: String,
        delta_fn: fn(&serde_json::Value) -> Option<String>,
    }

    let state = State {
        upstream: Box::pin(upstream),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
        backend_name,
        delta_fn,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    while let Some(pos) = state.buffer.iter().position(|&b| b == b'\n') {
                        let raw: Vec<u8> = state.buffer.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).trim().to_string();
                        let Some(data) = line.strip_prefix("data:") else {
                            continue;
                        };
                        let data = data.trim();
                        if data.is_empty() {
                            continue;
                        }
                        if data == "[DONE]" {
                            state.finished = true;
                            if let Ok(bytes) = encode_line(&StreamingContent::done()) {
                                state.pending.push_back(Ok(bytes));
                            }
                            continue;
                        }
                        match serde_json::from_str::<serde_json::Value>(data) {
                            Ok(json) => {
                                if let Some(delta) = (state.delta_fn)(&json) {
                                    if !delta.is_empty() {
                                        if let Ok(bytes) = encode_line(&StreamingContent::chunk(delta)) {
                                            state.pending.push_back(Ok(bytes));
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                state.pending.push_back(Err(ProxyError::Backend(format!(
                                    "{} sent malformed SSE payload: {e}",
                                    state.backend_name
                                ))));
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.push_back(Err(ProxyError::Backend(format!(
                        "{} stream read failed: {e}",
                        state.backend_name
                    ))));
                }
                None => {
                    state.finished = true;
                }
            }
        }
    }))
}
