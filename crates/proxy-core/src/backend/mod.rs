use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ProxyError, Result};
use crate::message::{ChatRequest, ResponseEnvelope};

/// Identity headers sent with every outbound call (spec.md §4.7), with a
/// per-backend override taking precedence over the global identity.
#[derive(Debug, Clone, Default)]
pub struct IdentityHeaders {
    pub http_referer: Option<String>,
    pub x_title: Option<String>,
}

impl IdentityHeaders {
    pub fn merged_with_override(&self, over: Option<&IdentityHeaders>) -> IdentityHeaders {
        match over {
            Some(o) => IdentityHeaders {
                http_referer: o.http_referer.clone().or_else(|| self.http_referer.clone()),
                x_title: o.x_title.clone().or_else(|| self.x_title.clone()),
            },
            None => self.clone(),
        }
    }

    pub fn as_header_map(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        if let Some(v) = &self.http_referer {
            headers.insert("HTTP-Referer".to_string(), v.clone());
        }
        if let Some(v) = &self.x_title {
            headers.insert("X-Title".to_string(), v.clone());
        }
        headers
    }
}

/// A named backend capability (spec.md §4.7 C7). Concrete adapters live in
/// `proxy-providers`; this crate only defines the seam.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self, config: &HashMap<String, String>) -> Result<()>;

    async fn chat_completions(
        &self,
        request: &ChatRequest,
        effective_model: &str,
        key: &str,
        identity: &IdentityHeaders,
    ) -> Result<ResponseEnvelope>;

    async fn get_available_models(&self) -> Result<Vec<String>>;
}

/// Registry of named backend adapters plus the global identity config
/// (spec.md §4.7 "dispatch chooses an adapter by `backend` name").
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
    global_identity: IdentityHeaders,
    per_backend_identity: HashMap<String, IdentityHeaders>,
}

impl BackendRegistry {
    pub fn new(global_identity: IdentityHeaders) -> Self {
        Self {
            backends: HashMap::new(),
            global_identity,
            per_backend_identity: HashMap::new(),
        }
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn set_identity_override(&mut self, backend: impl Into<String>, identity: IdentityHeaders) {
        self.per_backend_identity.insert(backend.into(), identity);
    }

    pub fn functional_backends(&self) -> Vec<String> {
        let mut names: Vec<_> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.backends.get(name)
    }

    fn identity_for(&self, backend: &str) -> IdentityHeaders {
        self.global_identity
            .merged_with_override(self.per_backend_identity.get(backend))
    }

    /// Dispatches a single attempt to its named backend, injecting identity
    /// headers (spec.md §4.7).
    pub async fn dispatch(
        &self,
        backend_name: &str,
        request: &ChatRequest,
        effective_model: &str,
        key: &str,
    ) -> Result<ResponseEnvelope> {
        let backend = self
            .backends
            .get(backend_name)
            .ok_or_else(|| ProxyError::Backend(format!("unknown backend '{backend_name}'")))?;
        let identity = self.identity_for(backend_name);
        backend
            .chat_completions(request, effective_model, key, &identity)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubBackend {
        name: &'static str,
    }

    #[async_trait]
    impl Backend for StubBackend {
        fn name(&self) -> &str {
            self.name
        }
        async fn initialize(&self, _config: &HashMap<String, String>) -> Result<()> {
            Ok(())
        }
        async fn chat_completions(
            &self,
            _request: &ChatRequest,
            _effective_model: &str,
            _key: &str,
            identity: &IdentityHeaders,
        ) -> Result<ResponseEnvelope> {
            Ok(ResponseEnvelope::json(
                200,
                serde_json::json!({"referer": identity.http_referer}),
            ))
        }
        async fn get_available_models(&self) -> Result<Vec<String>> {
            Ok(vec!["model-a".to_string()])
        }
    }

    #[test]
    fn per_backend_identity_overrides_global() {
        let global = IdentityHeaders {
            http_referer: Some("global".to_string()),
            x_title: None,
        };
        let mut registry = BackendRegistry::new(global);
        registry.register(Arc::new(StubBackend { name: "openrouter" }));
        registry.set_identity_override(
            "openrouter",
            IdentityHeaders {
                http_referer: Some("override".to_string()),
                x_title: None,
            },
        );
        assert_eq!(
            registry.identity_for("openrouter").http_referer,
            Some("override".to_string())
        );
        assert_eq!(
            registry.identity_for("other").http_referer,
            Some("global".to_string())
        );
    }

    #[tokio::test]
    async fn dispatch_fails_for_unknown_backend() {
        let registry = BackendRegistry::new(IdentityHeaders::default());
        let req = ChatRequest {
            model: "m".to_string(),
            messages: Vec::new(),
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            tools: None,
            tool_choice: None,
            session_id: None,
            extra: HashMap::new(),
        };
        let result = registry.dispatch("nope", &req, "m", "k").await;
        assert!(result.is_err());
    }
}
