use serde_json::Value;

use crate::message::ChatMessage;

/// Outcome of executing a single command (spec.md §3 `CommandResult`).
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub name: String,
    pub success: bool,
    pub message: String,
    /// Non-empty `data` on a successful result means "state changed, also
    /// call the backend" (spec.md §4.3).
    pub data: Option<Value>,
}

impl CommandResult {
    pub fn ok(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with_data(name: impl Into<String>, message: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Result of running the command parser/dispatcher across a message list
/// (spec.md §4.3 "Dispatch result surface").
#[derive(Debug, Clone)]
pub struct ProcessedResult {
    pub modified_messages: Vec<ChatMessage>,
    pub command_executed: bool,
    pub command_results: Vec<CommandResult>,
}

impl ProcessedResult {
    /// True when every modified message has empty content and a command ran
    /// (spec.md §4.3: the orchestrator then returns a synthetic reply).
    pub fn is_command_only(&self) -> bool {
        self.command_executed
            && self
                .modified_messages
                .iter()
                .all(|m| m.content.is_empty())
    }

    /// True if any successful result carries `data`, meaning state changed
    /// but the backend should still be called (spec.md §4.3).
    pub fn any_result_carries_data(&self) -> bool {
        self.command_results
            .iter()
            .any(|r| r.success && r.data.is_some())
    }
}
