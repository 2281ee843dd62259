mod resolver;
mod state;
mod store;

pub use resolver::{RequestContext, SessionResolver};
pub use state::{
    BackendConfig, FailoverRoute, LoopConfig, OneOff, ReasoningConfig, ReasoningEffort,
    RoutePolicy, SessionState, SessionStateBuilder, ToolLoopMode,
};
pub use store::{
    InMemorySessionStore, InteractionHandler, Session, SessionInteraction, SessionStore,
    SessionStoreError,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stable per-request session identifier (spec.md §3, §4.2).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate(prefix: &str) -> Self {
        SessionId(format!("{prefix}-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
