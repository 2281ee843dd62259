use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// Policy for expanding a failover route into an attempt list (spec.md §3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePolicy {
    /// Key-fan: one attempt per key of the first element's backend.
    K,
    /// Model-fan: one attempt per element, first key only.
    M,
    /// Keys-then-models: every key of every element.
    Km,
    /// Models-then-keys: round-robin across elements per key index.
    Mk,
}

/// A named, ordered list of `backend:model` strings with a composition policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverRoute {
    pub policy: RoutePolicy,
    pub elements: Vec<String>,
}

/// A single-shot `(backend, model)` override consumed after the next
/// successful backend call (spec.md §3 `oneoff`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneOff {
    pub backend: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub backend_type: Option<String>,
    pub model: Option<String>,
    #[serde(default = "default_true")]
    pub interactive_mode: bool,
    pub openai_url: Option<String>,
    #[serde(default)]
    pub failover_routes: HashMap<String, FailoverRoute>,
    pub oneoff: Option<OneOff>,
}

fn default_true() -> bool {
    true
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: None,
            model: None,
            interactive_mode: true,
            openai_url: None,
            failover_routes: HashMap::new(),
            oneoff: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
    Maximum,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningConfig {
    pub reasoning_effort: Option<ReasoningEffort>,
    pub thinking_budget: Option<u32>,
    pub temperature: Option<f32>,
    #[serde(default)]
    pub reasoning_config: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub gemini_generation_config: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolLoopMode {
    Break,
    Warn,
    ChanceThenBreak,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_true")]
    pub loop_detection_enabled: bool,
    #[serde(default = "default_true")]
    pub tool_loop_detection_enabled: bool,
    pub tool_loop_max_repeats: Option<u32>,
    pub tool_loop_ttl_seconds: Option<u32>,
    pub tool_loop_mode: Option<ToolLoopMode>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            loop_detection_enabled: true,
            tool_loop_detection_enabled: true,
            tool_loop_max_repeats: None,
            tool_loop_ttl_seconds: None,
            tool_loop_mode: None,
        }
    }
}

/// Immutable per-session configuration snapshot (spec.md §3, §4.1).
///
/// Every `with_*` mutator returns a new `SessionState`; the receiver is
/// never modified (spec.md §8 invariant 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub backend_config: BackendConfig,
    pub reasoning_config: ReasoningConfig,
    pub loop_config: LoopConfig,
    pub project: Option<String>,
    pub project_dir: Option<String>,
    pub interactive_just_enabled: bool,
    pub hello_requested: bool,
    pub is_cline_agent: bool,
}

impl SessionState {
    pub fn builder(&self) -> SessionStateBuilder {
        SessionStateBuilder {
            state: self.clone(),
        }
    }

    pub fn with_temperature(&self, value: f32) -> Result<Self> {
        if !(0.0..=2.0).contains(&value) {
            return Err(ProxyError::HandlerValidation(format!(
                "temperature {value} out of range [0.0, 2.0]"
            )));
        }
        let mut next = self.clone();
        next.reasoning_config.temperature = Some(value);
        Ok(next)
    }

    pub fn with_thinking_budget(&self, value: u32) -> Result<Self> {
        if !(128..=32768).contains(&value) {
            return Err(ProxyError::HandlerValidation(format!(
                "thinking_budget {value} out of range [128, 32768]"
            )));
        }
        let mut next = self.clone();
        next.reasoning_config.thinking_budget = Some(value);
        Ok(next)
    }

    pub fn with_reasoning_effort(&self, value: ReasoningEffort) -> Self {
        let mut next = self.clone();
        next.reasoning_config.reasoning_effort = Some(value);
        next
    }

    pub fn with_backend(&self, backend: Option<String>) -> Self {
        let mut next = self.clone();
        next.backend_config.backend_type = backend;
        next
    }

    pub fn with_model(&self, model: Option<String>) -> Self {
        let mut next = self.clone();
        next.backend_config.model = model;
        next
    }

    pub fn with_openai_url(&self, url: String) -> Result<Self> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ProxyError::HandlerValidation(format!(
                "openai-url must start with http:// or https://, got {url}"
            )));
        }
        let mut next = self.clone();
        next.backend_config.openai_url = Some(url);
        Ok(next)
    }

    pub fn with_project(&self, project: Option<String>) -> Self {
        let mut next = self.clone();
        next.project = project;
        next
    }

    pub fn with_project_dir(&self, dir: Option<String>) -> Self {
        let mut next = self.clone();
        next.project_dir = dir;
        next
    }

    pub fn with_loop_detection(&self, enabled: bool) -> Self {
        let mut next = self.clone();
        next.loop_config.loop_detection_enabled = enabled;
        next
    }

    pub fn with_tool_loop_detection(&self, enabled: bool) -> Self {
        let mut next = self.clone();
        next.loop_config.tool_loop_detection_enabled = enabled;
        next
    }

    pub fn with_tool_loop_max_repeats(&self, value: u32) -> Result<Self> {
        if value < 2 {
            return Err(ProxyError::HandlerValidation(
                "tool-loop-max-repeats must be >= 2".to_string(),
            ));
        }
        let mut next = self.clone();
        next.loop_config.tool_loop_max_repeats = Some(value);
        Ok(next)
    }

    pub fn with_tool_loop_ttl(&self, value: u32) -> Result<Self> {
        if value < 1 {
            return Err(ProxyError::HandlerValidation(
                "tool-loop-ttl must be >= 1".to_string(),
            ));
        }
        let mut next = self.clone();
        next.loop_config.tool_loop_ttl_seconds = Some(value);
        Ok(next)
    }

    pub fn with_tool_loop_mode(&self, mode: ToolLoopMode) -> Self {
        let mut next = self.clone();
        next.loop_config.tool_loop_mode = Some(mode);
        next
    }

    pub fn with_oneoff(&self, backend: String, model: String) -> Self {
        let mut next = self.clone();
        next.backend_config.oneoff = Some(OneOff { backend, model });
        next
    }

    /// Clears the one-off override; called on successful backend dispatch
    /// (spec.md §4.5 "on success a oneoff override is cleared").
    pub fn without_oneoff(&self) -> Self {
        let mut next = self.clone();
        next.backend_config.oneoff = None;
        next
    }

    pub fn with_hello_requested(&self, value: bool) -> Self {
        let mut next = self.clone();
        next.hello_requested = value;
        next
    }

    pub fn with_interactive_just_enabled(&self, value: bool) -> Self {
        let mut next = self.clone();
        next.interactive_just_enabled = value;
        next
    }

    pub fn upsert_route(&self, name: String, route: FailoverRoute) -> Self {
        let mut next = self.clone();
        next.backend_config.failover_routes.insert(name, route);
        next
    }

    pub fn remove_route(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.backend_config.failover_routes.remove(name);
        next
    }
}

/// Holds sub-configuration references during a chain of mutations and is
/// discarded after `build()` (spec.md §9 "builder pattern").
pub struct SessionStateBuilder {
    state: SessionState,
}

impl SessionStateBuilder {
    pub fn temperature(mut self, value: f32) -> Result<Self> {
        self.state = self.state.with_temperature(value)?;
        Ok(self)
    }

    pub fn backend(mut self, backend: Option<String>) -> Self {
        self.state = self.state.with_backend(backend);
        self
    }

    pub fn build(self) -> SessionState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutators_do_not_modify_receiver() {
        let base = SessionState::default();
        let next = base.with_temperature(0.5).unwrap();
        assert_eq!(base.reasoning_config.temperature, None);
        assert_eq!(next.reasoning_config.temperature, Some(0.5));
    }

    #[test]
    fn temperature_boundaries() {
        let base = SessionState::default();
        assert!(base.with_temperature(0.0).is_ok());
        assert!(base.with_temperature(2.0).is_ok());
        assert!(base.with_temperature(-0.0001).is_err());
        assert!(base.with_temperature(2.0001).is_err());
    }

    #[test]
    fn thinking_budget_boundaries() {
        let base = SessionState::default();
        assert!(base.with_thinking_budget(128).is_ok());
        assert!(base.with_thinking_budget(32768).is_ok());
        assert!(base.with_thinking_budget(127).is_err());
        assert!(base.with_thinking_budget(32769).is_err());
    }

    #[test]
    fn tool_loop_max_repeats_boundary() {
        let base = SessionState::default();
        assert!(base.with_tool_loop_max_repeats(1).is_err());
        assert!(base.with_tool_loop_max_repeats(2).is_ok());
    }

    #[test]
    fn builder_with_no_calls_round_trips() {
        let base = SessionState::default();
        let rebuilt = base.builder().build();
        assert_eq!(
            serde_json::to_string(&base).unwrap(),
            serde_json::to_string(&rebuilt).unwrap()
        );
    }
}
