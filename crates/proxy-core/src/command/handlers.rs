use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::json;

use super::parser::ArgValue;
use super::registry::{ApplicationState, CommandHandler, HandlerOutcome};
use crate::session::{FailoverRoute, ReasoningEffort, RoutePolicy, SessionState, ToolLoopMode};

fn arg_str<'a>(args: &'a HashMap<String, ArgValue>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(ArgValue::as_str)
}

/// The single positional/bare value of a command like `!/temperature(0.2)`
/// or `!/backend(openrouter)`, which the parser stores keyed by the literal
/// text it saw (no `=`).
fn positional(args: &HashMap<String, ArgValue>) -> Option<&str> {
    args.iter().find_map(|(k, v)| match v {
        ArgValue::Bool(true) => Some(k.as_str()),
        ArgValue::Text(t) if k == t => Some(t.as_str()),
        _ => None,
    })
}

fn value_or_positional<'a>(args: &'a HashMap<String, ArgValue>, key: &str) -> Option<&'a str> {
    arg_str(args, key).or_else(|| positional(args))
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

pub struct BackendHandler;
impl CommandHandler for BackendHandler {
    fn name(&self) -> &str {
        "backend"
    }
    fn aliases(&self) -> &[&str] {
        &["default-backend"]
    }
    fn description(&self) -> &str {
        "Sets the session's default backend override"
    }
    fn examples(&self) -> &[&str] {
        &["!/backend(openrouter)"]
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let Some(value) = value_or_positional(args, "backend") else {
            return HandlerOutcome::fail("backend requires a value");
        };
        let functional = app.functional_backends();
        if !functional.iter().any(|b| b == value) {
            let cleared = state.with_backend(None);
            return HandlerOutcome {
                success: false,
                message: format!("backend '{value}' is not functional; cleared override"),
                new_state: Some(cleared),
                data: None,
            };
        }
        HandlerOutcome::ok(
            format!("backend set to {value}"),
            state.with_backend(Some(value.to_string())),
        )
    }
}

pub struct ModelHandler;
impl CommandHandler for ModelHandler {
    fn name(&self) -> &str {
        "model"
    }
    fn description(&self) -> &str {
        "Overrides the session's model, optionally qualified as backend:model"
    }
    fn examples(&self) -> &[&str] {
        &["!/model(openrouter:z-ai/glm)"]
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let Some(value) = value_or_positional(args, "model") else {
            return HandlerOutcome::fail("model requires a value");
        };
        let qualified = value
            .split_once(':')
            .or_else(|| value.split_once('/'));
        let interactive = state.backend_config.interactive_mode;
        if let Some((backend, _model)) = qualified {
            if interactive && !app.functional_backends().iter().any(|b| b == backend) {
                return HandlerOutcome::fail(format!(
                    "backend '{backend}' in model override is unknown"
                ));
            }
        }
        HandlerOutcome::ok(
            format!("model set to {value} (possibly invalid until first use)"),
            state.with_model(Some(value.to_string())),
        )
    }
}

pub struct ReasoningEffortHandler;
impl CommandHandler for ReasoningEffortHandler {
    fn name(&self) -> &str {
        "reasoning-effort"
    }
    fn description(&self) -> &str {
        "Sets reasoning effort: low, medium, high, maximum"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        if app.thinking_budget_cli_override().is_some() {
            return HandlerOutcome::fail(
                "reasoning-effort is fixed by a CLI thinking-budget override",
            );
        }
        let Some(value) = value_or_positional(args, "reasoning-effort") else {
            return HandlerOutcome::fail("reasoning-effort requires a value");
        };
        let effort = match value {
            "low" => ReasoningEffort::Low,
            "medium" => ReasoningEffort::Medium,
            "high" => ReasoningEffort::High,
            "maximum" => ReasoningEffort::Maximum,
            other => {
                return HandlerOutcome::fail(format!("unknown reasoning-effort '{other}'"));
            }
        };
        HandlerOutcome::ok(
            format!("reasoning-effort set to {value}"),
            state.with_reasoning_effort(effort),
        )
    }
}

pub struct ThinkingBudgetHandler;
impl CommandHandler for ThinkingBudgetHandler {
    fn name(&self) -> &str {
        "thinking-budget"
    }
    fn description(&self) -> &str {
        "Sets the thinking token budget, in [128, 32768]"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        if app.thinking_budget_cli_override().is_some() {
            return HandlerOutcome::fail(
                "thinking-budget is fixed by a CLI override and cannot be changed interactively",
            );
        }
        let Some(value) = value_or_positional(args, "thinking-budget") else {
            return HandlerOutcome::fail("thinking-budget requires a value");
        };
        match value.parse::<u32>() {
            Ok(v) => match state.with_thinking_budget(v) {
                Ok(next) => HandlerOutcome::ok(format!("thinking-budget set to {v}"), next),
                Err(e) => HandlerOutcome::fail(e.to_string()),
            },
            Err(_) => HandlerOutcome::fail(format!("invalid thinking-budget '{value}'")),
        }
    }
}

pub struct TemperatureHandler;
impl CommandHandler for TemperatureHandler {
    fn name(&self) -> &str {
        "temperature"
    }
    fn description(&self) -> &str {
        "Sets sampling temperature, in [0.0, 2.0]"
    }
    fn examples(&self) -> &[&str] {
        &["!/set(temperature=0.2)"]
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let Some(value) = value_or_positional(args, "temperature") else {
            return HandlerOutcome::fail("temperature requires a value");
        };
        match value.parse::<f32>() {
            Ok(v) => match state.with_temperature(v) {
                // Continues to backend: this is the "may carry data" case
                // from spec.md §4.3's temperature example.
                Ok(next) => HandlerOutcome::ok_continue(
                    format!("temperature set to {v}"),
                    next,
                    json!({"temperature": v}),
                ),
                Err(e) => HandlerOutcome::fail(e.to_string()),
            },
            Err(_) => HandlerOutcome::fail(format!("invalid temperature '{value}'")),
        }
    }
}

pub struct LoopDetectionHandler;
impl CommandHandler for LoopDetectionHandler {
    fn name(&self) -> &str {
        "loop-detection"
    }
    fn description(&self) -> &str {
        "Enables or disables loop detection for this session"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let enabled = args
            .get("loop-detection")
            .map(ArgValue::as_bool)
            .or_else(|| positional(args).map(|v| v != "false"))
            .unwrap_or(true);
        HandlerOutcome::ok(
            format!("loop-detection set to {enabled}"),
            state.with_loop_detection(enabled),
        )
    }
}

pub struct ToolLoopDetectionHandler;
impl CommandHandler for ToolLoopDetectionHandler {
    fn name(&self) -> &str {
        "tool-loop-detection"
    }
    fn description(&self) -> &str {
        "Enables or disables tool-call loop detection for this session"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let enabled = args
            .get("tool-loop-detection")
            .map(ArgValue::as_bool)
            .or_else(|| positional(args).map(|v| v != "false"))
            .unwrap_or(true);
        HandlerOutcome::ok(
            format!("tool-loop-detection set to {enabled}"),
            state.with_tool_loop_detection(enabled),
        )
    }
}

pub struct ToolLoopMaxRepeatsHandler;
impl CommandHandler for ToolLoopMaxRepeatsHandler {
    fn name(&self) -> &str {
        "tool-loop-max-repeats"
    }
    fn description(&self) -> &str {
        "Sets the repeat count that triggers tool-call loop detection (>= 2)"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let Some(value) = value_or_positional(args, "tool-loop-max-repeats") else {
            return HandlerOutcome::fail("tool-loop-max-repeats requires a value");
        };
        match value.parse::<u32>() {
            Ok(v) => match state.with_tool_loop_max_repeats(v) {
                Ok(next) => HandlerOutcome::ok(format!("tool-loop-max-repeats set to {v}"), next),
                Err(e) => HandlerOutcome::fail(e.to_string()),
            },
            Err(_) => HandlerOutcome::fail(format!("invalid tool-loop-max-repeats '{value}'")),
        }
    }
}

pub struct ToolLoopTtlHandler;
impl CommandHandler for ToolLoopTtlHandler {
    fn name(&self) -> &str {
        "tool-loop-ttl"
    }
    fn description(&self) -> &str {
        "Sets the tool-call loop detection window, in seconds (>= 1)"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let Some(value) = value_or_positional(args, "tool-loop-ttl") else {
            return HandlerOutcome::fail("tool-loop-ttl requires a value");
        };
        match value.parse::<u32>() {
            Ok(v) => match state.with_tool_loop_ttl(v) {
                Ok(next) => HandlerOutcome::ok(format!("tool-loop-ttl set to {v}s"), next),
                Err(e) => HandlerOutcome::fail(e.to_string()),
            },
            Err(_) => HandlerOutcome::fail(format!("invalid tool-loop-ttl '{value}'")),
        }
    }
}

pub struct ToolLoopModeHandler;
impl CommandHandler for ToolLoopModeHandler {
    fn name(&self) -> &str {
        "tool-loop-mode"
    }
    fn description(&self) -> &str {
        "Sets tool-call loop handling: break, warn, chance_then_break"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let Some(value) = value_or_positional(args, "tool-loop-mode") else {
            return HandlerOutcome::fail("tool-loop-mode requires a value");
        };
        let mode = match value {
            "break" => ToolLoopMode::Break,
            "warn" => ToolLoopMode::Warn,
            "chance_then_break" | "chance-then-break" => ToolLoopMode::ChanceThenBreak,
            other => return HandlerOutcome::fail(format!("unknown tool-loop-mode '{other}'")),
        };
        HandlerOutcome::ok(
            format!("tool-loop-mode set to {value}"),
            state.with_tool_loop_mode(mode),
        )
    }
}

pub struct ProjectHandler;
impl CommandHandler for ProjectHandler {
    fn name(&self) -> &str {
        "project"
    }
    fn description(&self) -> &str {
        "Sets the session's project name"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let Some(value) = value_or_positional(args, "project") else {
            return HandlerOutcome::fail("project requires a value");
        };
        HandlerOutcome::ok(
            format!("project set to {value}"),
            state.with_project(Some(value.to_string())),
        )
    }
}

pub struct ProjectDirHandler;
impl CommandHandler for ProjectDirHandler {
    fn name(&self) -> &str {
        "project-dir"
    }
    fn description(&self) -> &str {
        "Sets the session's project directory; must exist and be readable"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let Some(value) = value_or_positional(args, "project-dir") else {
            return HandlerOutcome::fail("project-dir requires a value");
        };
        let expanded = expand_tilde(value);
        match std::fs::metadata(&expanded) {
            Ok(meta) if meta.is_dir() => HandlerOutcome::ok(
                format!("project-dir set to {}", expanded.display()),
                state.with_project_dir(Some(expanded.to_string_lossy().to_string())),
            ),
            _ => HandlerOutcome::fail(format!(
                "project-dir '{}' does not exist or is not readable",
                expanded.display()
            )),
        }
    }
}

pub struct OpenAiUrlHandler;
impl CommandHandler for OpenAiUrlHandler {
    fn name(&self) -> &str {
        "openai-url"
    }
    fn description(&self) -> &str {
        "Overrides the OpenAI-compatible backend base URL"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let Some(value) = value_or_positional(args, "openai-url") else {
            return HandlerOutcome::fail("openai-url requires a value");
        };
        match state.with_openai_url(value.to_string()) {
            Ok(next) => HandlerOutcome::ok(format!("openai-url set to {value}"), next),
            Err(e) => HandlerOutcome::fail(e.to_string()),
        }
    }
}

fn parse_policy(s: &str) -> Option<RoutePolicy> {
    match s {
        "k" => Some(RoutePolicy::K),
        "m" => Some(RoutePolicy::M),
        "km" => Some(RoutePolicy::Km),
        "mk" => Some(RoutePolicy::Mk),
        _ => None,
    }
}

pub struct CreateFailoverRouteHandler;
impl CommandHandler for CreateFailoverRouteHandler {
    fn name(&self) -> &str {
        "create-failover-route"
    }
    fn description(&self) -> &str {
        "Creates a named failover route with a composition policy"
    }
    fn examples(&self) -> &[&str] {
        &["!/create-failover-route(name=gpt-4,policy=km)"]
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let Some(name) = arg_str(args, "name") else {
            return HandlerOutcome::fail("create-failover-route requires name=...");
        };
        let Some(policy_str) = arg_str(args, "policy") else {
            return HandlerOutcome::fail("create-failover-route requires policy=...");
        };
        let Some(policy) = parse_policy(policy_str) else {
            return HandlerOutcome::fail(format!("unknown policy '{policy_str}'"));
        };
        HandlerOutcome::ok(
            format!("created failover route '{name}'"),
            state.upsert_route(
                name.to_string(),
                FailoverRoute {
                    policy,
                    elements: Vec::new(),
                },
            ),
        )
    }
}

pub struct DeleteFailoverRouteHandler;
impl CommandHandler for DeleteFailoverRouteHandler {
    fn name(&self) -> &str {
        "delete-failover-route"
    }
    fn description(&self) -> &str {
        "Deletes a named failover route"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let Some(name) = value_or_positional(args, "name") else {
            return HandlerOutcome::fail("delete-failover-route requires a route name");
        };
        HandlerOutcome::ok(format!("deleted failover route '{name}'"), state.remove_route(name))
    }
}

fn route_mutate(
    args: &HashMap<String, ArgValue>,
    state: &SessionState,
    prepend: bool,
) -> HandlerOutcome {
    let Some(name) = arg_str(args, "name") else {
        return HandlerOutcome::fail("route command requires name=...");
    };
    let Some(element) = arg_str(args, "element") else {
        return HandlerOutcome::fail("route command requires element=\"backend:model\"");
    };
    let Some(mut route) = state.backend_config.failover_routes.get(name).cloned() else {
        return HandlerOutcome::fail(format!("no such failover route '{name}'"));
    };
    if prepend {
        route.elements.insert(0, element.to_string());
    } else {
        route.elements.push(element.to_string());
    }
    HandlerOutcome::ok(
        format!("route '{name}' now has {} elements", route.elements.len()),
        state.upsert_route(name.to_string(), route),
    )
}

pub struct RouteAppendHandler;
impl CommandHandler for RouteAppendHandler {
    fn name(&self) -> &str {
        "route-append"
    }
    fn description(&self) -> &str {
        "Appends a backend:model element to a failover route"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        route_mutate(args, state, false)
    }
}

pub struct RoutePrependHandler;
impl CommandHandler for RoutePrependHandler {
    fn name(&self) -> &str {
        "route-prepend"
    }
    fn description(&self) -> &str {
        "Prepends a backend:model element to a failover route"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        route_mutate(args, state, true)
    }
}

pub struct RouteClearHandler;
impl CommandHandler for RouteClearHandler {
    fn name(&self) -> &str {
        "route-clear"
    }
    fn description(&self) -> &str {
        "Clears all elements of a failover route"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let Some(name) = value_or_positional(args, "name") else {
            return HandlerOutcome::fail("route-clear requires a route name");
        };
        let Some(mut route) = state.backend_config.failover_routes.get(name).cloned() else {
            return HandlerOutcome::fail(format!("no such failover route '{name}'"));
        };
        route.elements.clear();
        HandlerOutcome::ok(
            format!("route '{name}' cleared"),
            state.upsert_route(name.to_string(), route),
        )
    }
}

pub struct RouteListHandler;
impl CommandHandler for RouteListHandler {
    fn name(&self) -> &str {
        "route-list"
    }
    fn aliases(&self) -> &[&str] {
        &["list-failover-routes"]
    }
    fn description(&self) -> &str {
        "Lists all configured failover routes"
    }
    fn handle(
        &self,
        _args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let names: Vec<_> = state
            .backend_config
            .failover_routes
            .keys()
            .cloned()
            .collect();
        HandlerOutcome::ok(format!("routes: {}", names.join(", ")), state.clone())
    }
}

pub struct OneoffHandler;
impl CommandHandler for OneoffHandler {
    fn name(&self) -> &str {
        "oneoff"
    }
    fn description(&self) -> &str {
        "Single-shot backend/model override for the next call"
    }
    fn examples(&self) -> &[&str] {
        &["!/oneoff(openrouter/z-ai/glm)"]
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let Some(value) = value_or_positional(args, "oneoff") else {
            return HandlerOutcome::fail("oneoff requires backend/model");
        };
        let split = value.split_once('/').or_else(|| value.split_once(':'));
        let Some((backend, model)) = split else {
            return HandlerOutcome::fail("oneoff requires backend/model or backend:model");
        };
        HandlerOutcome::ok(
            format!("oneoff set to {backend}/{model}"),
            state.with_oneoff(backend.to_string(), model.to_string()),
        )
    }
}

pub struct HelloHandler;
impl CommandHandler for HelloHandler {
    fn name(&self) -> &str {
        "hello"
    }
    fn description(&self) -> &str {
        "Requests a welcome banner on the synthetic reply"
    }
    fn handle(
        &self,
        _args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        HandlerOutcome::ok("hello requested", state.with_hello_requested(true))
    }
}

pub struct HelpHandler {
    registry: std::sync::Arc<parking_lot::RwLock<Option<super::registry::CommandRegistry>>>,
}

impl Default for HelpHandler {
    fn default() -> Self {
        Self {
            registry: std::sync::Arc::new(parking_lot::RwLock::new(None)),
        }
    }
}

impl HelpHandler {
    /// Bound after the full registry is built, so `help` can introspect
    /// every other handler (spec.md §4.4).
    pub fn bind(&self, registry: super::registry::CommandRegistry) {
        *self.registry.write() = Some(registry);
    }
}

impl CommandHandler for HelpHandler {
    fn name(&self) -> &str {
        "help"
    }
    fn description(&self) -> &str {
        "Lists commands, or describes one command's format and examples"
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let guard = self.registry.read();
        let Some(registry) = guard.as_ref() else {
            return HandlerOutcome::fail("help registry not bound");
        };
        if let Some(target) = positional(args) {
            return match registry.find(target) {
                Some(handler) => HandlerOutcome::ok(
                    format!(
                        "{}: {}\nexamples: {}",
                        handler.name(),
                        handler.description(),
                        handler.examples().join(", ")
                    ),
                    state.clone(),
                ),
                None => HandlerOutcome::fail(format!("no such command '{target}'")),
            };
        }
        let names: Vec<_> = registry.iter().map(|h| h.name().to_string()).collect();
        HandlerOutcome::ok(format!("available commands: {}", names.join(", ")), state.clone())
    }
}

/// Generic `!/set(key=value,...)` entry point: fans each pair out to the
/// per-field handler registered under that key, folding state through each
/// in document order (spec.md §8 invariant 2, example scenario 2).
pub struct SetHandler {
    registry: std::sync::Arc<parking_lot::RwLock<Option<super::registry::CommandRegistry>>>,
}

impl Default for SetHandler {
    fn default() -> Self {
        Self {
            registry: std::sync::Arc::new(parking_lot::RwLock::new(None)),
        }
    }
}

impl SetHandler {
    pub fn bind(&self, registry: super::registry::CommandRegistry) {
        *self.registry.write() = Some(registry);
    }
}

impl CommandHandler for SetHandler {
    fn name(&self) -> &str {
        "set"
    }
    fn description(&self) -> &str {
        "Sets one or more fields by key=value, delegating to each field's handler"
    }
    fn examples(&self) -> &[&str] {
        &["!/set(temperature=0.2)"]
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let guard = self.registry.read();
        let Some(registry) = guard.as_ref() else {
            return HandlerOutcome::fail("set registry not bound");
        };
        let mut current = state.clone();
        let mut messages = Vec::new();
        let mut data = None;
        for (key, value) in args {
            let Some(handler) = registry.find(key) else {
                return HandlerOutcome::fail(format!("set: unknown key '{key}'"));
            };
            let mut sub_args = HashMap::new();
            sub_args.insert(key.clone(), value.clone());
            let outcome = handler.handle(&sub_args, &current, app);
            if !outcome.success {
                return HandlerOutcome::fail(format!("set: {key}: {}", outcome.message));
            }
            if let Some(next) = outcome.new_state {
                current = next;
            }
            if outcome.data.is_some() {
                data = outcome.data;
            }
            messages.push(outcome.message);
        }
        match data {
            Some(d) => HandlerOutcome::ok_continue(messages.join("; "), current, d),
            None => HandlerOutcome::ok(messages.join("; "), current),
        }
    }
}

/// Bulk unset: restores defaults for settable keys (spec.md §4.4). Keys
/// marked persistent (e.g. `command-prefix`) are excluded from the
/// round-trip invariant in spec.md §8 and are not reset here since they are
/// process-wide, not per-session.
pub struct UnsetHandler;
impl CommandHandler for UnsetHandler {
    fn name(&self) -> &str {
        "unset"
    }
    fn description(&self) -> &str {
        "Restores default values for one or more settable keys"
    }
    fn examples(&self) -> &[&str] {
        &["!/unset(temperature,project)"]
    }
    fn handle(
        &self,
        args: &HashMap<String, ArgValue>,
        state: &SessionState,
        _app: &dyn ApplicationState,
    ) -> HandlerOutcome {
        let mut next = state.clone();
        let mut cleared = Vec::new();
        for key in args.keys() {
            match super::registry::normalize_key(key).as_str() {
                "temperature" => {
                    next.reasoning_config.temperature = None;
                    cleared.push("temperature");
                }
                "reasoning-effort" => {
                    next.reasoning_config.reasoning_effort = None;
                    cleared.push("reasoning-effort");
                }
                "thinking-budget" => {
                    next.reasoning_config.thinking_budget = None;
                    cleared.push("thinking-budget");
                }
                "backend" | "default-backend" => {
                    next.backend_config.backend_type = None;
                    cleared.push("backend");
                }
                "model" => {
                    next.backend_config.model = None;
                    cleared.push("model");
                }
                "project" => {
                    next.project = None;
                    cleared.push("project");
                }
                "project-dir" => {
                    next.project_dir = None;
                    cleared.push("project-dir");
                }
                "oneoff" => {
                    next.backend_config.oneoff = None;
                    cleared.push("oneoff");
                }
                other => {
                    return HandlerOutcome::fail(format!("unset: unknown key '{other}'"));
                }
            }
        }
        HandlerOutcome::ok(format!("unset: {}", cleared.join(", ")), next)
    }
}

/// Registers the canonical handler set from spec.md §4.4. `help` and `set`
/// need to see the finished registry (to introspect / fan out by key), so
/// they are bound in a second pass after every other handler is in place.
pub fn register_builtin_handlers(registry: &mut super::registry::CommandRegistry) {
    registry.register(std::sync::Arc::new(BackendHandler));
    registry.register(std::sync::Arc::new(ModelHandler));
    registry.register(std::sync::Arc::new(ReasoningEffortHandler));
    registry.register(std::sync::Arc::new(ThinkingBudgetHandler));
    registry.register(std::sync::Arc::new(TemperatureHandler));
    registry.register(std::sync::Arc::new(LoopDetectionHandler));
    registry.register(std::sync::Arc::new(ToolLoopDetectionHandler));
    registry.register(std::sync::Arc::new(ToolLoopMaxRepeatsHandler));
    registry.register(std::sync::Arc::new(ToolLoopTtlHandler));
    registry.register(std::sync::Arc::new(ToolLoopModeHandler));
    registry.register(std::sync::Arc::new(ProjectHandler));
    registry.register(std::sync::Arc::new(ProjectDirHandler));
    registry.register(std::sync::Arc::new(OpenAiUrlHandler));
    registry.register(std::sync::Arc::new(CreateFailoverRouteHandler));
    registry.register(std::sync::Arc::new(DeleteFailoverRouteHandler));
    registry.register(std::sync::Arc::new(RouteAppendHandler));
    registry.register(std::sync::Arc::new(RoutePrependHandler));
    registry.register(std::sync::Arc::new(RouteClearHandler));
    registry.register(std::sync::Arc::new(RouteListHandler));
    registry.register(std::sync::Arc::new(OneoffHandler));
    registry.register(std::sync::Arc::new(HelloHandler));
    registry.register(std::sync::Arc::new(UnsetHandler));

    let help = std::sync::Arc::new(HelpHandler::default());
    let set = std::sync::Arc::new(SetHandler::default());
    registry.register(help.clone());
    registry.register(set.clone());

    let complete = registry.clone();
    help.bind(complete.clone());
    set.bind(complete);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::registry::CommandRegistry;

    struct FakeApp;
    impl ApplicationState for FakeApp {
        fn command_prefix(&self) -> String {
            "!/".to_string()
        }
        fn redaction_enabled(&self) -> bool {
            true
        }
        fn functional_backends(&self) -> Vec<String> {
            vec!["openrouter".to_string(), "openai".to_string()]
        }
        fn project_name(&self) -> &str {
            "proxy"
        }
        fn project_version(&self) -> &str {
            "0.1.0"
        }
        fn thinking_budget_cli_override(&self) -> Option<u32> {
            None
        }
    }

    #[test]
    fn temperature_handler_sets_state_and_continues() {
        let handler = TemperatureHandler;
        let mut args = HashMap::new();
        args.insert("0.2".to_string(), ArgValue::Bool(true));
        let outcome = handler.handle(&args, &SessionState::default(), &FakeApp);
        assert!(outcome.success);
        assert!(outcome.data.is_some());
        assert_eq!(
            outcome.new_state.unwrap().reasoning_config.temperature,
            Some(0.2)
        );
    }

    #[test]
    fn set_then_unset_restores_prior_value() {
        let base = SessionState::default();
        let set = base.with_temperature(0.7).unwrap();
        let mut unset_args = HashMap::new();
        unset_args.insert("temperature".to_string(), ArgValue::Bool(true));
        let outcome = UnsetHandler.handle(&unset_args, &set, &FakeApp);
        assert_eq!(outcome.new_state.unwrap().reasoning_config.temperature, None);
        assert_eq!(base.reasoning_config.temperature, None);
    }

    #[test]
    fn backend_handler_rejects_unknown_backend() {
        let mut args = HashMap::new();
        args.insert("backend".to_string(), ArgValue::Text("nope".to_string()));
        let outcome = BackendHandler.handle(&args, &SessionState::default(), &FakeApp);
        assert!(!outcome.success);
    }
}
