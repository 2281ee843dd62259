use super::{Middleware, MiddlewareContext};
use crate::error::Result;
use crate::redaction::Redactor;
use crate::stream::StreamingContent;

/// Second line of defense against secrets leaking in yielded chunks, e.g. an
/// echoed prompt fragment (spec.md §4.9 middleware 4).
pub struct RedactionMirrorMiddleware {
    redactor: Redactor,
}

impl RedactionMirrorMiddleware {
    pub fn new(redactor: Redactor) -> Self {
        Self { redactor }
    }
}

impl Middleware for RedactionMirrorMiddleware {
    fn priority(&self) -> i32 {
        40
    }

    fn name(&self) -> &str {
        "redaction-mirror"
    }

    fn process(&self, mut content: StreamingContent, _ctx: &mut MiddlewareContext) -> Result<StreamingContent> {
        content.content = self.redactor.redact_text(&content.content);
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_redaction_onto_streamed_chunks() {
        let middleware = RedactionMirrorMiddleware::new(Redactor::new(vec!["SECRET".to_string()], "!/"));
        let mut ctx = MiddlewareContext::default();
        let out = middleware
            .process(StreamingContent::chunk("leaked SECRET here"), &mut ctx)
            .unwrap();
        assert_eq!(out.content, "leaked (API_KEY_HAS_BEEN_REDACTED) here");
    }
}
