//! Backend-agnostic core of the interactive LLM reverse proxy: the command
//! DSL, session state machine, failover coordinator, response middleware
//! chain, and request processor. Concrete backend adapters and the HTTP
//! surface live in separate crates.

pub mod backend;
pub mod capture;
pub mod command;
pub mod error;
pub mod failover;
pub mod message;
pub mod middleware;
pub mod processor;
pub mod redaction;
pub mod session;
pub mod stream;

pub use error::{ProxyError, Result};
pub use message::{ChatMessage, ChatRequest, Content, ContentPart, ResponseEnvelope, Role};
pub use processor::RequestProcessor;
