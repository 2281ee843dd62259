//! Reference backend adapters (OpenAI-compatible, Anthropic, Gemini,
//! OpenRouter) plus the Anthropic<->OpenAI wire converters. Concrete
//! backends are pluggable per the core's design; this crate supplies a
//! usable default set so the service binary has something to dispatch to.

mod anthropic;
mod http_backend;
mod models;
mod openai;

pub use anthropic::{anthropic_request_to_canonical, canonical_response_to_anthropic, AnthropicAdapter};
pub use http_backend::{ChatAdapter, HttpBackend};
pub use models::fallback_models;
pub use openai::OpenAiCompatibleAdapter;
