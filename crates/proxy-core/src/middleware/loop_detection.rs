use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::{Middleware, MiddlewareContext};
use crate::error::{ProxyError, Result};
use crate::session::ToolLoopMode;
use crate::stream::StreamingContent;

#[derive(Debug, Clone, Copy)]
pub struct LoopDetectionConfig {
    pub min_pattern_length: usize,
    pub max_pattern_length: usize,
    pub repeat_threshold: usize,
    /// Upper bound on the rolling buffer kept per request.
    pub window_size: usize,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            min_pattern_length: 3,
            max_pattern_length: 64,
            repeat_threshold: 8,
            window_size: 4096,
        }
    }
}

/// Detects a short pattern repeating past threshold in the rolling output
/// buffer and aborts the response (spec.md §4.9 middleware 1, text loops).
pub struct LoopDetectionMiddleware {
    config: LoopDetectionConfig,
    enabled: bool,
    buffer: parking_lot::Mutex<String>,
}

impl LoopDetectionMiddleware {
    pub fn new(config: LoopDetectionConfig, enabled: bool) -> Self {
        Self {
            config,
            enabled,
            buffer: parking_lot::Mutex::new(String::new()),
        }
    }

    /// True if `buffer`'s tail consists of some pattern of length `len`
    /// repeated `threshold` or more times contiguously.
    fn tail_repeats(buffer: &str, len: usize, threshold: usize) -> bool {
        let needed = len * threshold;
        if buffer.len() < needed {
            return false;
        }
        let tail = &buffer[buffer.len() - needed..];
        let bytes = tail.as_bytes();
        let pattern = &bytes[..len];
        bytes.chunks(len).all(|chunk| chunk == pattern)
    }
}

impl Middleware for LoopDetectionMiddleware {
    fn priority(&self) -> i32 {
        10
    }

    fn name(&self) -> &str {
        "loop-detection"
    }

    fn process(&self, content: StreamingContent, _ctx: &mut MiddlewareContext) -> Result<StreamingContent> {
        if !self.enabled || content.content.is_empty() {
            return Ok(content);
        }
        let mut buffer = self.buffer.lock();
        buffer.push_str(&content.content);
        let excess = buffer.len().saturating_sub(self.config.window_size);
        if excess > 0 {
            buffer.drain(..excess);
        }
        for len in self.config.min_pattern_length..=self.config.max_pattern_length {
            if Self::tail_repeats(&buffer, len, self.config.repeat_threshold) {
                return Err(ProxyError::LoopDetection);
            }
        }
        drop(buffer);
        Ok(content)
    }
}

/// Verdict returned by [`ToolCallLoopDetector::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolLoopVerdict {
    Continue,
    Warn,
    Break,
}

struct ToolCallRecord {
    count: u32,
    first_seen: Instant,
}

/// Counts structurally identical tool invocations within a TTL window per
/// session, independent of the streamed-text loop detector above (spec.md
/// §4.9 "tool-call loop detection").
#[derive(Default)]
pub struct ToolCallLoopDetector {
    seen: parking_lot::Mutex<HashMap<String, ToolCallRecord>>,
    /// Sessions that have already received one warning under
    /// `chance_then_break` — the next repeat breaks.
    warned_once: parking_lot::Mutex<std::collections::HashSet<String>>,
}

impl ToolCallLoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `fingerprint` should structurally identify the tool call (name +
    /// canonicalized args). Returns the verdict for this occurrence.
    pub fn observe(
        &self,
        session_key: &str,
        fingerprint: &str,
        max_repeats: u32,
        ttl: Duration,
        mode: ToolLoopMode,
    ) -> ToolLoopVerdict {
        let key = format!("{session_key}:{fingerprint}");
        let now = Instant::now();
        let mut guard = self.seen.lock();
        let record = guard.entry(key.clone()).or_insert(ToolCallRecord {
            count: 0,
            first_seen: now,
        });
        if now.duration_since(record.first_seen) > ttl {
            record.count = 0;
            record.first_seen = now;
        }
        record.count += 1;
        let count = record.count;
        drop(guard);

        if count < max_repeats {
            return ToolLoopVerdict::Continue;
        }

        match mode {
            ToolLoopMode::Break => ToolLoopVerdict::Break,
            ToolLoopMode::Warn => ToolLoopVerdict::Warn,
            ToolLoopMode::ChanceThenBreak => {
                let mut warned = self.warned_once.lock();
                if warned.contains(&key) {
                    ToolLoopVerdict::Break
                } else {
                    warned.insert(key);
                    ToolLoopVerdict::Warn
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeating_pattern_triggers_abort() {
        let config = LoopDetectionConfig {
            min_pattern_length: 1,
            max_pattern_length: 4,
            repeat_threshold: 6,
            window_size: 4096,
        };
        let middleware = LoopDetectionMiddleware::new(config, true);
        let mut ctx = MiddlewareContext::default();
        let result = middleware.process(StreamingContent::chunk("aaaaaaaaaa"), &mut ctx);
        assert!(matches!(result, Err(ProxyError::LoopDetection)));
    }

    #[test]
    fn disabled_middleware_never_aborts() {
        let middleware = LoopDetectionMiddleware::new(LoopDetectionConfig::default(), false);
        let mut ctx = MiddlewareContext::default();
        let result = middleware.process(StreamingContent::chunk("aaaaaaaaaaaaaaaaaaaaaaaaaa"), &mut ctx);
        assert!(result.is_ok());
    }

    #[test]
    fn varied_text_never_triggers() {
        let middleware = LoopDetectionMiddleware::new(LoopDetectionConfig::default(), true);
        let mut ctx = MiddlewareContext::default();
        let result = middleware.process(
            StreamingContent::chunk("the quick brown fox jumps over the lazy dog"),
            &mut ctx,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn tool_loop_break_mode_breaks_immediately_at_threshold() {
        let detector = ToolCallLoopDetector::new();
        for _ in 0..2 {
            let verdict =
                detector.observe("s1", "call-a", 3, Duration::from_secs(60), ToolLoopMode::Break);
            assert_eq!(verdict, ToolLoopVerdict::Continue);
        }
        let verdict = detector.observe("s1", "call-a", 3, Duration::from_secs(60), ToolLoopMode::Break);
        assert_eq!(verdict, ToolLoopVerdict::Break);
    }

    #[test]
    fn tool_loop_chance_then_break_warns_once_then_breaks() {
        let detector = ToolCallLoopDetector::new();
        for _ in 0..2 {
            detector.observe("s1", "call-b", 2, Duration::from_secs(60), ToolLoopMode::ChanceThenBreak);
        }
        let first_trigger = detector.observe(
            "s1",
            "call-b",
            2,
            Duration::from_secs(60),
            ToolLoopMode::ChanceThenBreak,
        );
        assert_eq!(first_trigger, ToolLoopVerdict::Warn);
        let second_trigger = detector.observe(
            "s1",
            "call-b",
            2,
            Duration::from_secs(60),
            ToolLoopMode::ChanceThenBreak,
        );
        assert_eq!(second_trigger, ToolLoopVerdict::Break);
    }
}
