use regex::Regex;

use crate::message::{ChatMessage, Content, ContentPart};

const REDACTED_MARKER: &str = "(API_KEY_HAS_BEEN_REDACTED)";

/// Scrubs known API keys from user-facing text and strips any residual
/// command syntax that survived parsing (spec.md §4.8 C8). Applied to the
/// outbound request payload and to the wire-capture record alike.
pub struct Redactor {
    known_keys: Vec<String>,
    command_prefix_re: Regex,
}

impl Redactor {
    pub fn new(known_keys: Vec<String>, command_prefix: &str) -> Self {
        let escaped = regex::escape(command_prefix);
        let command_prefix_re =
            Regex::new(&format!(r"{escaped}[A-Za-z][A-Za-z0-9_-]*(\([^)]*\))?"))
                .expect("redaction command regex is well-formed");
        let mut known_keys = known_keys;
        // Longest-first so a key that is a prefix of another doesn't
        // partially mask it.
        known_keys.sort_by_key(|k| std::cmp::Reverse(k.len()));
        Self {
            known_keys,
            command_prefix_re,
        }
    }

    /// Redacts a single text value. Non-text content is left untouched by
    /// callers (spec.md §4.8 "non-text parts are untouched").
    pub fn redact_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        for key in &self.known_keys {
            if key.is_empty() {
                continue;
            }
            out = out.replace(key.as_str(), REDACTED_MARKER);
        }
        self.command_prefix_re.replace_all(&out, "").to_string()
    }

    /// Redacts every text segment of a message list in place, leaving
    /// non-text parts untouched.
    pub fn redact_messages(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        messages
            .iter()
            .map(|message| {
                let mut next = message.clone();
                next.content = match &message.content {
                    Content::Text(text) => Content::Text(self.redact_text(text)),
                    Content::Parts(parts) => Content::Parts(
                        parts
                            .iter()
                            .map(|part| match part {
                                ContentPart::Text { text } => ContentPart::Text {
                                    text: self.redact_text(text),
                                },
                                other => other.clone(),
                            })
                            .collect(),
                    ),
                };
                next
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_known_key_and_residual_command_syntax() {
        let redactor = Redactor::new(vec!["RED_SECRET_ABC".to_string()], "!/");
        let out = redactor.redact_text("Use RED_SECRET_ABC and !/help");
        assert_eq!(out, "Use (API_KEY_HAS_BEEN_REDACTED) and ");
    }

    #[test]
    fn longer_keys_are_redacted_before_their_prefixes() {
        let redactor = Redactor::new(
            vec!["ABC".to_string(), "ABCDEF".to_string()],
            "!/",
        );
        let out = redactor.redact_text("key is ABCDEF");
        assert_eq!(out, "key is (API_KEY_HAS_BEEN_REDACTED)");
    }

    #[test]
    fn non_text_parts_are_left_untouched() {
        let redactor = Redactor::new(vec!["SECRET".to_string()], "!/");
        let messages = vec![ChatMessage {
            role: crate::message::Role::User,
            content: Content::Parts(vec![ContentPart::Opaque]),
            tool_call_id: None,
            name: None,
        }];
        let redacted = redactor.redact_messages(&messages);
        match &redacted[0].content {
            Content::Parts(parts) => assert!(matches!(parts[0], ContentPart::Opaque)),
            _ => panic!("expected parts"),
        }
    }
}
