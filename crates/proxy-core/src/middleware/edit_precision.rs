use std::collections::HashMap;

use parking_lot::Mutex;

use super::{Middleware, MiddlewareContext};
use crate::error::Result;
use crate::stream::StreamingContent;

const DEFAULT_MARKERS: &[&str] = &["diff_error", "edit_failed", "apply_patch_error"];

/// The tuning applied to the next request for a session once a pending
/// edit-failure marker has been observed (spec.md §4.9 middleware 2).
#[derive(Debug, Clone, Copy)]
pub struct EditPrecisionTuning {
    pub temperature: f32,
    pub top_p: Option<f32>,
}

/// Per-session pending counters: how many upcoming requests should receive
/// the tuned sampling parameters (spec.md §5 "per-session map, serialized").
#[derive(Default)]
pub struct PendingTuningStore {
    pending: Mutex<HashMap<String, u32>>,
}

impl PendingTuningStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_pending(&self, session_id: &str) {
        *self.pending.lock().entry(session_id.to_string()).or_insert(0) += 1;
    }

    /// Returns whether the upcoming request for `session_id` should be
    /// tuned, decrementing the counter (spec.md §4.9 "the counter decrements
    /// after the tuned request").
    pub fn take_if_pending(&self, session_id: &str) -> bool {
        let mut guard = self.pending.lock();
        match guard.get_mut(session_id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    guard.remove(session_id);
                }
                true
            }
            _ => false,
        }
    }
}

/// Scans streamed output for edit-failure markers and records a pending
/// tuning for the session's next request (spec.md §4.9 middleware 2).
pub struct EditPrecisionMiddleware {
    markers: Vec<String>,
    store: std::sync::Arc<PendingTuningStore>,
}

impl EditPrecisionMiddleware {
    pub fn new(store: std::sync::Arc<PendingTuningStore>) -> Self {
        Self {
            markers: DEFAULT_MARKERS.iter().map(|s| s.to_string()).collect(),
            store,
        }
    }

    /// Computes the tuned sampling parameters for a request that has a
    /// pending edit-precision adjustment (spec.md §4.9: `temperature ←
    /// configured_low`, `top_p ← max(top_p, min_top_p)` if enabled).
    pub fn tuning(low_temperature: f32, current_top_p: Option<f32>, min_top_p: Option<f32>) -> EditPrecisionTuning {
        EditPrecisionTuning {
            temperature: low_temperature,
            top_p: match (current_top_p, min_top_p) {
                (Some(cur), Some(min)) => Some(cur.max(min)),
                (None, Some(min)) => Some(min),
                (cur, None) => cur,
            },
        }
    }
}

impl Middleware for EditPrecisionMiddleware {
    fn priority(&self) -> i32 {
        20
    }

    fn name(&self) -> &str {
        "edit-precision"
    }

    fn process(&self, content: StreamingContent, ctx: &mut MiddlewareContext) -> Result<StreamingContent> {
        if self.markers.iter().any(|m| content.content.contains(m.as_str())) {
            self.store.mark_pending(&ctx.session_id);
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_in_stream_marks_session_pending() {
        let store = std::sync::Arc::new(PendingTuningStore::new());
        let middleware = EditPrecisionMiddleware::new(store.clone());
        let mut ctx = MiddlewareContext {
            session_id: "s1".to_string(),
        };
        middleware
            .process(StreamingContent::chunk("got a diff_error here"), &mut ctx)
            .unwrap();
        assert!(store.take_if_pending("s1"));
        assert!(!store.take_if_pending("s1"));
    }

    #[test]
    fn tuning_respects_min_top_p_floor() {
        let tuning = EditPrecisionMiddleware::tuning(0.15, Some(0.5), Some(0.8));
        assert_eq!(tuning.temperature, 0.15);
        assert_eq!(tuning.top_p, Some(0.8));
    }
}
