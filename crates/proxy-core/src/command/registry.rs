use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::parser::ArgValue;
use crate::session::SessionState;

/// Narrow capability a handler may use to read process-wide configuration
/// (command prefix, redaction flag, functional backends, ...) without the
/// handler becoming impure over session state (spec.md §4.4).
pub trait ApplicationState: Send + Sync {
    fn command_prefix(&self) -> String;
    fn redaction_enabled(&self) -> bool;
    fn functional_backends(&self) -> Vec<String>;
    fn project_name(&self) -> &str;
    fn project_version(&self) -> &str;
    /// `Some(budget)` if the process was launched with a CLI override for
    /// `THINKING_BUDGET`, which gates the `thinking-budget`/`reasoning-effort`
    /// commands (spec.md §4.4 "Gated").
    fn thinking_budget_cli_override(&self) -> Option<u32>;
    /// Persists a command-driven config change (e.g. default backend).
    /// Returns whether persistence is actually bound; the core never
    /// touches the filesystem itself (spec.md §9).
    fn save_config(&self, _key: &str, _value: &str) -> bool {
        false
    }
}

/// Outcome of a single handler invocation (spec.md §4.4 `handle(...)`).
pub struct HandlerOutcome {
    pub success: bool,
    pub message: String,
    pub new_state: Option<SessionState>,
    pub data: Option<Value>,
}

impl HandlerOutcome {
    pub fn ok(message: impl Into<String>, new_state: SessionState) -> Self {
        Self {
            success: true,
            message: message.into(),
            new_state: Some(new_state),
            data: None,
        }
    }

    pub fn ok_continue(message: impl Into<String>, new_state: SessionState, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            new_state: Some(new_state),
            data: Some(data),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            new_state: None,
            data: None,
        }
    }
}

/// One handler per recognized parameter (spec.md §4.4). Handlers are pure
/// functions of `(args, state)` except via the `ApplicationState` capability.
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &str;
    fn aliases(&self) -> &[&str] {
        &[]
    }
    fn description(&self) -> &str;
    fn examples(&self) -> &[&str] {
        &[]
    }

    fn can_handle(&self, param_name: &str) -> bool {
        let normalized = normalize_key(param_name);
        normalize_key(self.name()) == normalized
            || self.aliases().iter().any(|a| normalize_key(a) == normalized)
    }

    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        app: &dyn ApplicationState,
    ) -> HandlerOutcome;
}

/// Underscore/dash-insensitive key normalization for alias matching
/// (spec.md §4.4 "underscore↔dash normalized").
pub fn normalize_key(key: &str) -> String {
    key.to_lowercase().replace('_', "-")
}

/// Registry keyed by lowercased, dash-normalized name/alias (spec.md §9
/// "registry keyed by lowercased name/alias; no reflection required").
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: Vec<Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.handlers.push(handler);
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn CommandHandler>> {
        self.handlers.iter().find(|h| h.can_handle(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn CommandHandler>> {
        self.handlers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;
    impl CommandHandler for Dummy {
        fn name(&self) -> &str {
            "tool-loop-ttl"
        }
        fn description(&self) -> &str {
            "test"
        }
        fn handle(
            &self,
            _args: &HashMap<String, ArgValue>,
            state: &SessionState,
            _app: &dyn ApplicationState,
        ) -> HandlerOutcome {
            HandlerOutcome::ok("ok", state.clone())
        }
    }

    #[test]
    fn find_is_underscore_dash_insensitive() {
        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(Dummy));
        assert!(registry.find("tool_loop_ttl").is_some());
        assert!(registry.find("tool-loop-ttl").is_some());
        assert!(registry.find("nonexistent").is_none());
    }
}
