use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

/// Result of a `check_limit` call (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitInfo {
    pub is_limited: bool,
    pub remaining: u32,
    /// Seconds until the oldest stamp leaves the window, if currently limited.
    pub reset_at: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Limit {
    max: u32,
    window: Duration,
}

#[derive(Debug, Default)]
struct KeyState {
    limit: Option<Limit>,
    stamps: Vec<u64>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Per-key sliding-window rate limiter (spec.md §4.6 C6). The default limit
/// applies to keys that never called `set_limit`.
pub struct RateLimiter {
    default_limit: Limit,
    keys: RwLock<HashMap<String, KeyState>>,
}

impl RateLimiter {
    pub fn new(default_max: u32, default_window: Duration) -> Self {
        Self {
            default_limit: Limit {
                max: default_max,
                window: default_window,
            },
            keys: RwLock::new(HashMap::new()),
        }
    }

    fn purge(state: &mut KeyState, window: Duration, now: u64) {
        let cutoff = now.saturating_sub(window.as_secs());
        state.stamps.retain(|s| *s > cutoff);
    }

    /// Purges stale stamps, then reports whether `key` is currently limited
    /// (spec.md §4.6 `check_limit`).
    pub fn check_limit(&self, key: &str) -> RateLimitInfo {
        let now = now_secs();
        let mut guard = self.keys.write();
        let state = guard.entry(key.to_string()).or_default();
        let limit = state.limit.unwrap_or(self.default_limit);
        Self::purge(state, limit.window, now);

        let used = state.stamps.len() as u32;
        if used >= limit.max {
            let reset_at = state.stamps.first().map(|oldest| oldest + limit.window.as_secs());
            RateLimitInfo {
                is_limited: true,
                remaining: 0,
                reset_at,
            }
        } else {
            RateLimitInfo {
                is_limited: false,
                remaining: limit.max - used,
                reset_at: None,
            }
        }
    }

    /// Records `cost` units of usage against `key` (spec.md §4.6 `record_usage`).
    pub fn record_usage(&self, key: &str, cost: u32) {
        let now = now_secs();
        let mut guard = self.keys.write();
        let state = guard.entry(key.to_string()).or_default();
        state.stamps.extend(std::iter::repeat(now).take(cost as usize));
    }

    pub fn reset(&self, key: &str) {
        self.keys.write().remove(key);
    }

    pub fn set_limit(&self, key: &str, max: u32, window: Duration) {
        let mut guard = self.keys.write();
        let state = guard.entry(key.to_string()).or_default();
        state.limit = Some(Limit { max, window });
    }

    /// Records an upstream 429's `retry_after` by pinning enough stamps that
    /// the key reads as limited until that moment (spec.md §4.5 "records a
    /// 429's retry-after on the limiter").
    pub fn record_retry_after(&self, key: &str, retry_after_secs: u64) {
        let now = now_secs();
        let mut guard = self.keys.write();
        let state = guard.entry(key.to_string()).or_default();
        let limit = state.limit.unwrap_or(self.default_limit);
        state.limit = Some(limit);
        // Backdate a stamp so `oldest + window == now + retry_after`.
        let backdated = (now + retry_after_secs).saturating_sub(limit.window.as_secs());
        state.stamps = vec![backdated; limit.max as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_trips_after_max_usages_within_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(!limiter.check_limit("k").is_limited);
        limiter.record_usage("k", 1);
        assert!(!limiter.check_limit("k").is_limited);
        limiter.record_usage("k", 1);
        let info = limiter.check_limit("k");
        assert!(info.is_limited);
        assert!(info.reset_at.is_some());
    }

    #[test]
    fn reset_clears_usage() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.record_usage("k", 1);
        assert!(limiter.check_limit("k").is_limited);
        limiter.reset("k");
        assert!(!limiter.check_limit("k").is_limited);
    }

    #[test]
    fn per_key_override_limit_is_honored() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.set_limit("special", 5, Duration::from_secs(60));
        for _ in 0..4 {
            limiter.record_usage("special", 1);
        }
        assert!(!limiter.check_limit("special").is_limited);
    }

    #[test]
    fn record_retry_after_trips_limit_until_deadline() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        limiter.record_retry_after("k", 30);
        let info = limiter.check_limit("k");
        assert!(info.is_limited);
        let reset_at = info.reset_at.unwrap();
        let now = now_secs();
        assert!(reset_at >= now + 29 && reset_at <= now + 31);
    }
}
