pub mod handlers;
pub mod parser;
pub mod registry;
pub mod result;

use crate::message::{ChatMessage, Content, ContentPart};
use crate::session::SessionState;

pub use handlers::register_builtin_handlers;
pub use parser::{ArgValue, CommandParser, ParsedCommand};
pub use registry::{ApplicationState, CommandHandler, CommandRegistry, HandlerOutcome};
pub use result::{CommandResult, ProcessedResult};

/// How unknown commands are handled once the known-command span is removed
/// (spec.md §4.3 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownCommandPolicy {
    /// Default outside interactive sessions: leave the literal text in place.
    Preserve,
    /// Default for interactive sessions: drop the span like a known command.
    Drop,
}

/// Runs the command DSL over a message list: finds the newest message that
/// contains a command, processes it, and returns the resulting message list
/// plus every command outcome (spec.md §4.3).
pub struct CommandProcessor {
    parser: CommandParser,
    unknown_policy: UnknownCommandPolicy,
}

impl CommandProcessor {
    pub fn new(prefix: impl Into<String>, unknown_policy: UnknownCommandPolicy) -> Self {
        Self {
            parser: CommandParser::new(prefix),
            unknown_policy,
        }
    }

    /// Processes `messages` against `state`, invoking `registry`/`app` for
    /// every command found. Returns the updated messages, the folded session
    /// state, and the full `ProcessedResult` dispatch surface.
    pub fn process(
        &self,
        messages: &[ChatMessage],
        state: &SessionState,
        registry: &CommandRegistry,
        app: &dyn ApplicationState,
    ) -> (Vec<ChatMessage>, SessionState, ProcessedResult) {
        let mut modified = messages.to_vec();
        let mut current_state = state.clone();
        let mut command_results = Vec::new();
        let mut command_executed = false;

        // Spec.md §4.3: "the last message whose content contains a command,
        // iterating messages from newest to oldest and stopping at the first
        // match." Messages are stored oldest-first, so we scan in reverse.
        let target = modified
            .iter()
            .enumerate()
            .rev()
            .find(|(_, m)| self.message_contains_command(m));

        let Some((idx, _)) = target else {
            return (
                modified,
                current_state,
                ProcessedResult {
                    modified_messages: messages.to_vec(),
                    command_executed: false,
                    command_results: Vec::new(),
                },
            );
        };

        let new_content = match &modified[idx].content {
            Content::Text(text) => {
                let (out, executed, results, next_state) =
                    self.process_segment(text, &current_state, registry, app);
                current_state = next_state;
                command_executed |= executed;
                command_results.extend(results);
                Content::Text(out)
            }
            Content::Parts(parts) => {
                let mut new_parts = Vec::with_capacity(parts.len());
                let mut found = false;
                for part in parts {
                    match part {
                        ContentPart::Text { text } if !found => {
                            let (out, executed, results, next_state) =
                                self.process_segment(text, &current_state, registry, app);
                            current_state = next_state;
                            if executed {
                                found = true;
                                command_executed = true;
                            }
                            command_results.extend(results);
                            if !out.trim().is_empty() {
                                new_parts.push(ContentPart::Text { text: out });
                            }
                        }
                        other => new_parts.push(other.clone()),
                    }
                }
                Content::Parts(new_parts)
            }
        };
        modified[idx].content = new_content;

        let result = ProcessedResult {
            modified_messages: modified.clone(),
            command_executed,
            command_results,
        };
        (modified, current_state, result)
    }

    fn message_contains_command(&self, message: &ChatMessage) -> bool {
        match &message.content {
            Content::Text(text) => !self.parser.find_commands(text).is_empty(),
            Content::Parts(parts) => parts.iter().any(|p| match p {
                ContentPart::Text { text } => !self.parser.find_commands(text).is_empty(),
                ContentPart::Opaque => false,
            }),
        }
    }

    /// Implements the four numbered steps of spec.md §4.3 for one text
    /// segment, folding `state` through every command found left-to-right.
    fn process_segment(
        &self,
        text: &str,
        state: &SessionState,
        registry: &CommandRegistry,
        app: &dyn ApplicationState,
    ) -> (String, bool, Vec<CommandResult>, SessionState) {
        let commands = self.parser.find_commands(text);
        if commands.is_empty() {
            return (text.to_string(), false, Vec::new(), state.clone());
        }

        let mut current_state = state.clone();
        let mut results = Vec::new();
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        let mut any_known = false;

        for command in &commands {
            out.push_str(&text[cursor..command.span.0]);
            cursor = command.span.1;

            match registry.find(&command.name) {
                Some(handler) => {
                    any_known = true;
                    let outcome = handler.handle(&command.args, &current_state, app);
                    if outcome.success {
                        if let Some(next) = outcome.new_state {
                            current_state = next;
                        }
                        results.push(CommandResult {
                            name: command.name.clone(),
                            success: true,
                            message: outcome.message,
                            data: outcome.data,
                        });
                    } else {
                        // Failure: span still removed, state unchanged
                        // (spec.md §4.4 "Failure semantics").
                        results.push(CommandResult {
                            name: command.name.clone(),
                            success: false,
                            message: outcome.message,
                            data: None,
                        });
                    }
                }
                None => {
                    if self.unknown_policy == UnknownCommandPolicy::Preserve {
                        out.push_str(&text[command.span.0..command.span.1]);
                    }
                    results.push(CommandResult::fail(
                        command.name.clone(),
                        format!("unknown command '{}'", command.name),
                    ));
                }
            }
        }
        out.push_str(&text[cursor..]);

        let cleaned = parser::collapse_and_strip(&out);
        (cleaned, any_known, results, current_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct FakeApp;
    impl ApplicationState for FakeApp {
        fn command_prefix(&self) -> String {
            "!/".to_string()
        }
        fn redaction_enabled(&self) -> bool {
            true
        }
        fn functional_backends(&self) -> Vec<String> {
            vec!["openrouter".to_string()]
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

    struct HelloStub;
    impl CommandHandler for HelloStub {
        fn name(&self) -> &str {
            "hello"
        }
        fn description(&self) -> &str {
            "test hello"
        }
        fn handle(
            &self,
            _args: &HashMap<String, ArgValue>,
            state: &SessionState,
            _app: &dyn ApplicationState,
        ) -> HandlerOutcome {
            HandlerOutcome::ok("hi", state.with_hello_requested(true))
        }
    }

    fn registry_with_hello() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(HelloStub));
        registry.register(Arc::new(handlers::TemperatureHandler));
        registry
    }

    #[test]
    fn pure_command_message_is_emptied_and_flagged() {
        let processor = CommandProcessor::new("!/", UnknownCommandPolicy::Drop);
        let registry = registry_with_hello();
        let messages = vec![ChatMessage::user("!/hello")];
        let (modified, state, result) =
            processor.process(&messages, &SessionState::default(), &registry, &FakeApp);
        assert!(result.command_executed);
        assert!(result.is_command_only());
        assert!(modified[0].content.is_empty());
        assert!(state.hello_requested);
    }

    #[test]
    fn command_then_prompt_keeps_remaining_text_and_carries_data() {
        let processor = CommandProcessor::new("!/", UnknownCommandPolicy::Drop);
        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(handlers::TemperatureHandler));
        let set = Arc::new(handlers::SetHandler::default());
        registry.register(set.clone());
        set.bind(registry.clone());

        let messages = vec![ChatMessage::user("!/set(temperature=0.2) Summarize: hi")];
        let (modified, state, result) =
            processor.process(&messages, &SessionState::default(), &registry, &FakeApp);
        assert!(!result.is_command_only());
        assert!(result.any_result_carries_data());
        assert_eq!(state.reasoning_config.temperature, Some(0.2));
        assert_eq!(modified[0].content.as_text(), Some("Summarize: hi"));
    }

    #[test]
    fn newest_matching_message_wins() {
        let processor = CommandProcessor::new("!/", UnknownCommandPolicy::Drop);
        let registry = registry_with_hello();
        let messages = vec![
            ChatMessage::user("!/hello old"),
            ChatMessage::assistant("no command here"),
            ChatMessage::user("!/hello new"),
        ];
        let (modified, _state, result) =
            processor.process(&messages, &SessionState::default(), &registry, &FakeApp);
        assert!(result.command_executed);
        assert_eq!(modified[0].content.as_text(), Some("!/hello old"));
        assert_eq!(modified[2].content.as_text(), Some("new"));
    }

    #[test]
    fn unknown_command_preserved_in_non_interactive_default() {
        let processor = CommandProcessor::new("!/", UnknownCommandPolicy::Preserve);
        let registry = CommandRegistry::new();
        let messages = vec![ChatMessage::user("!/unknown-thing hi")];
        let (modified, _state, result) =
            processor.process(&messages, &SessionState::default(), &registry, &FakeApp);
        assert!(!result.command_results.is_empty());
        assert!(!result.command_results[0].success);
        assert_eq!(modified[0].content.as_text(), Some("!/unknown-thing hi"));
    }

    #[test]
    fn unknown_command_under_drop_policy_does_not_count_as_executed() {
        let processor = CommandProcessor::new("!/", UnknownCommandPolicy::Drop);
        let registry = CommandRegistry::new();
        let messages = vec![ChatMessage::user("!/bogus hi")];
        let (modified, _state, result) =
            processor.process(&messages, &SessionState::default(), &registry, &FakeApp);
        assert!(!result.command_executed);
        assert!(modified[0].content.is_empty());
        assert!(!result.command_results.is_empty());
        assert!(!result.command_results[0].success);
    }
}
