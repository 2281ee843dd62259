use super::{Middleware, MiddlewareContext};
use crate::error::Result;
use crate::stream::StreamingContent;

/// Repairs truncated JSON at end-of-stream by closing unmatched
/// braces/brackets and completing a dangling string literal (spec.md §4.9
/// middleware 3, config-gated and optional).
pub struct JsonRepairMiddleware {
    enabled: bool,
}

impl JsonRepairMiddleware {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Closes any unmatched `{`/`[` and an unterminated string, in the order
    /// needed to produce syntactically valid (if semantically truncated)
    /// JSON. Ignores braces/brackets inside string literals.
    pub fn repair(input: &str) -> String {
        let mut stack = Vec::new();
        let mut in_string = false;
        let mut escaped = false;
        for ch in input.chars() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    in_string = false;
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                '{' => stack.push('}'),
                '[' => stack.push(']'),
                '}' | ']' => {
                    stack.pop();
                }
                _ => {}
            }
        }

        let mut out = input.to_string();
        if in_string {
            out.push('"');
        }
        while let Some(closer) = stack.pop() {
            out.push(closer);
        }
        out
    }
}

impl Middleware for JsonRepairMiddleware {
    fn priority(&self) -> i32 {
        30
    }

    fn name(&self) -> &str {
        "json-repair"
    }

    fn process(&self, mut content: StreamingContent, _ctx: &mut MiddlewareContext) -> Result<StreamingContent> {
        if self.enabled && content.is_done && !content.content.is_empty() {
            content.content = Self::repair(&content.content);
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closes_unmatched_braces_and_brackets() {
        assert_eq!(
            JsonRepairMiddleware::repair(r#"{"a":[1,2,{"b":3"#),
            r#"{"a":[1,2,{"b":3}]}"#
        );
    }

    #[test]
    fn closes_dangling_string() {
        assert_eq!(
            JsonRepairMiddleware::repair(r#"{"a":"incomplete"#),
            r#"{"a":"incomplete"}"#
        );
    }

    #[test]
    fn leaves_well_formed_json_untouched() {
        let input = r#"{"a":1}"#;
        assert_eq!(JsonRepairMiddleware::repair(input), input);
    }

    #[test]
    fn disabled_middleware_passes_through() {
        let middleware = JsonRepairMiddleware::new(false);
        let mut ctx = MiddlewareContext::default();
        let mut content = StreamingContent::chunk(r#"{"a":"#);
        content.is_done = true;
        let out = middleware.process(content, &mut ctx).unwrap();
        assert_eq!(out.content, r#"{"a":"#);
    }
}
