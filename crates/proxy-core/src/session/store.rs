use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{SessionId, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("session store backend error: {0}")]
    Backend(String),
}

/// A single recorded interaction appended to a session's history
/// (spec.md §3 `SessionInteraction`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInteraction {
    pub prompt: String,
    pub handler: InteractionHandler,
    pub backend: Option<String>,
    pub model: Option<String>,
    pub project: Option<String>,
    pub parameters: Option<Value>,
    pub response: Option<String>,
    pub usage: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionHandler {
    Proxy,
    Backend,
}

/// A live session: identity, current state snapshot, history, and agent tag
/// (spec.md §3 `Session`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub state: SessionState,
    pub history: Vec<SessionInteraction>,
    pub agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    fn new(session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            state: SessionState::default(),
            history: Vec::new(),
            agent: None,
            created_at: now,
            last_active_at: now,
        }
    }
}

/// Abstracts session persistence so the core never touches storage directly
/// (spec.md §4.1; pluggable per spec.md §1 Non-goals). Mirrors the teacher's
/// `SessionStore` trait shape (one async method per operation, errors via a
/// dedicated enum).
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the existing session or creates one with default state
    /// (spec.md §4.1 `get_or_create`, never fails).
    async fn get_or_create(&self, id: &SessionId) -> Session;

    /// Atomically swaps in a new session snapshot, preserving monotonic
    /// `last_active_at` (spec.md §4.1 `update`).
    async fn update(&self, session: Session) -> Result<(), SessionStoreError>;

    async fn delete(&self, id: &SessionId) -> Result<bool, SessionStoreError>;
}

/// Default in-memory store: a concurrent map guarded by a single lock, one
/// `Session` value per id, swapped atomically on update (spec.md §4.1).
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, id: &SessionId) -> Session {
        if let Some(existing) = self.sessions.read().get(id) {
            return existing.clone();
        }
        let mut guard = self.sessions.write();
        guard
            .entry(id.clone())
            .or_insert_with(|| Session::new(id.clone()))
            .clone()
    }

    async fn update(&self, mut session: Session) -> Result<(), SessionStoreError> {
        let mut guard = self.sessions.write();
        if let Some(existing) = guard.get(&session.session_id) {
            if session.last_active_at < existing.last_active_at {
                session.last_active_at = existing.last_active_at;
            }
        }
        guard.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, SessionStoreError> {
        Ok(self.sessions.write().remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_idempotent_then_mutates() {
        let store = InMemorySessionStore::new();
        let id = SessionId("s1".to_string());
        let session = store.get_or_create(&id).await;
        assert!(session.history.is_empty());

        let mut updated = session.clone();
        updated.history.push(SessionInteraction {
            prompt: "hi".to_string(),
            handler: InteractionHandler::Proxy,
            backend: None,
            model: None,
            project: None,
            parameters: None,
            response: Some("hello".to_string()),
            usage: None,
            timestamp: Utc::now(),
        });
        store.update(updated).await.unwrap();

        let fetched = store.get_or_create(&id).await;
        assert_eq!(fetched.history.len(), 1);
    }
}
