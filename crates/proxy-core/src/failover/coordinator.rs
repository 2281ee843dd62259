use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::rate_limiter::RateLimiter;
use crate::error::{ProxyError, Result};
use crate::message::ResponseEnvelope;
use crate::session::{FailoverRoute, RoutePolicy, SessionState};

/// Declared API keys per backend, in configuration order (spec.md §4.5
/// "in key declaration order").
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    keys: HashMap<String, Vec<String>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_keys(&mut self, backend: impl Into<String>, keys: Vec<String>) {
        self.keys.insert(backend.into(), keys);
    }

    pub fn keys_for(&self, backend: &str) -> &[String] {
        self.keys.get(backend).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first_key(&self, backend: &str) -> Option<&String> {
        self.keys_for(backend).first()
    }
}

/// One `(backend, model, key)` triple the coordinator will try, in order
/// (spec.md §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub backend: String,
    pub model: String,
    pub key: String,
}

impl Attempt {
    fn rate_limit_key(&self) -> String {
        format!("{}:{}:{}", self.backend, self.model, self.key)
    }
}

fn split_element(element: &str) -> Option<(&str, &str)> {
    element.split_once(':')
}

/// Expands a route's `(policy, elements)` into the ordered attempt list
/// (spec.md §4.5).
pub fn expand_route(route: &FailoverRoute, keys: &KeyRegistry) -> Vec<Attempt> {
    match route.policy {
        RoutePolicy::K => {
            let Some((backend, model)) = route.elements.first().and_then(|e| split_element(e))
            else {
                return Vec::new();
            };
            keys.keys_for(backend)
                .iter()
                .map(|key| Attempt {
                    backend: backend.to_string(),
                    model: model.to_string(),
                    key: key.clone(),
                })
                .collect()
        }
        RoutePolicy::M => route
            .elements
            .iter()
            .filter_map(|e| split_element(e))
            .filter_map(|(backend, model)| {
                keys.first_key(backend).map(|key| Attempt {
                    backend: backend.to_string(),
                    model: model.to_string(),
                    key: key.clone(),
                })
            })
            .collect(),
        RoutePolicy::Km => route
            .elements
            .iter()
            .filter_map(|e| split_element(e))
            .flat_map(|(backend, model)| {
                keys.keys_for(backend).iter().map(move |key| Attempt {
                    backend: backend.to_string(),
                    model: model.to_string(),
                    key: key.clone(),
                })
            })
            .collect(),
        RoutePolicy::Mk => {
            let parsed: Vec<(&str, &str)> = route
                .elements
                .iter()
                .filter_map(|e| split_element(e))
                .collect();
            let max_keys = parsed
                .iter()
                .map(|(backend, _)| keys.keys_for(backend).len())
                .max()
                .unwrap_or(0);
            let mut out = Vec::new();
            for i in 0..max_keys {
                for (backend, model) in &parsed {
                    if let Some(key) = keys.keys_for(backend).get(i) {
                        out.push(Attempt {
                            backend: backend.to_string(),
                            model: model.to_string(),
                            key: key.clone(),
                        });
                    }
                }
            }
            out
        }
    }
}

/// Builds the ordered attempt list for `effective_model` given the session's
/// routes, falling back to the session's default backend (spec.md §4.5).
pub fn build_attempts(
    effective_model: &str,
    state: &SessionState,
    default_backend: Option<&str>,
    keys: &KeyRegistry,
) -> Vec<Attempt> {
    if let Some(route) = state.backend_config.failover_routes.get(effective_model) {
        return expand_route(route, keys);
    }
    let backend = state
        .backend_config
        .backend_type
        .as_deref()
        .or(default_backend);
    match backend.and_then(|b| keys.first_key(b).map(|k| (b, k))) {
        Some((backend, key)) => vec![Attempt {
            backend: backend.to_string(),
            model: effective_model.to_string(),
            key: key.clone(),
        }],
        None => Vec::new(),
    }
}

/// Executes one attempt against a concrete backend adapter. Implemented by
/// the backend dispatcher (C7) so the coordinator stays adapter-agnostic.
#[async_trait]
pub trait AttemptExecutor: Send + Sync {
    async fn execute(&self, attempt: &Attempt) -> Result<ResponseEnvelope>;
}

/// Drives an ordered attempt list against the rate limiter and an executor
/// (spec.md §4.5 "the coordinator then drives attempts in order").
pub struct FailoverCoordinator<'a> {
    limiter: &'a RateLimiter,
}

impl<'a> FailoverCoordinator<'a> {
    pub fn new(limiter: &'a RateLimiter) -> Self {
        Self { limiter }
    }

    pub async fn drive(
        &self,
        attempts: &[Attempt],
        executor: &dyn AttemptExecutor,
    ) -> Result<ResponseEnvelope> {
        if attempts.is_empty() {
            return Err(ProxyError::Capacity(
                "no failover attempts available".to_string(),
            ));
        }

        let mut earliest_reset: Option<u64> = None;
        let mut last_error: Option<ProxyError> = None;
        let mut any_real_attempt = false;

        for attempt in attempts {
            let rl_key = attempt.rate_limit_key();
            let info = self.limiter.check_limit(&rl_key);
            if info.is_limited {
                if let Some(reset_at) = info.reset_at {
                    earliest_reset = Some(earliest_reset.map_or(reset_at, |r| r.min(reset_at)));
                }
                continue;
            }

            any_real_attempt = true;
            self.limiter.record_usage(&rl_key, 1);
            match executor.execute(attempt).await {
                Ok(envelope) => return Ok(envelope),
                Err(ProxyError::RateLimit { retry_after }) => {
                    if let Some(secs) = retry_after {
                        self.limiter.record_retry_after(&rl_key, secs);
                        let reset_at = now_secs() + secs;
                        earliest_reset = Some(earliest_reset.map_or(reset_at, |r| r.min(reset_at)));
                    }
                    last_error = Some(ProxyError::RateLimit { retry_after });
                }
                Err(other) => {
                    last_error = Some(other);
                }
            }
        }

        if !any_real_attempt {
            if let Some(reset_at) = earliest_reset {
                let now = now_secs();
                return Err(ProxyError::RateLimit {
                    retry_after: Some(reset_at.saturating_sub(now)),
                });
            }
        }

        Err(last_error.unwrap_or_else(|| ProxyError::Backend("all attempts exhausted".to_string())))
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[allow(dead_code)]
fn default_window() -> Duration {
    Duration::from_secs(60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RoutePolicy;

    fn keys() -> KeyRegistry {
        let mut keys = KeyRegistry::new();
        keys.set_keys("openrouter", vec!["K1".to_string(), "K2".to_string()]);
        keys.set_keys("gemini", vec!["K3".to_string()]);
        keys
    }

    #[test]
    fn k_policy_fans_over_first_element_keys() {
        let route = FailoverRoute {
            policy: RoutePolicy::K,
            elements: vec!["openrouter:a".to_string(), "gemini:b".to_string()],
        };
        let attempts = expand_route(&route, &keys());
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].key, "K1");
        assert_eq!(attempts[1].key, "K2");
        assert!(attempts.iter().all(|a| a.backend == "openrouter"));
    }

    #[test]
    fn m_policy_takes_first_key_per_element() {
        let route = FailoverRoute {
            policy: RoutePolicy::M,
            elements: vec!["openrouter:a".to_string(), "gemini:b".to_string()],
        };
        let attempts = expand_route(&route, &keys());
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].key, "K1");
        assert_eq!(attempts[1].key, "K3");
    }

    #[test]
    fn km_policy_matches_scenario_3() {
        let route = FailoverRoute {
            policy: RoutePolicy::Km,
            elements: vec!["openrouter:a".to_string(), "gemini:b".to_string()],
        };
        let attempts = expand_route(&route, &keys());
        assert_eq!(
            attempts,
            vec![
                Attempt {
                    backend: "openrouter".to_string(),
                    model: "a".to_string(),
                    key: "K1".to_string()
                },
                Attempt {
                    backend: "openrouter".to_string(),
                    model: "a".to_string(),
                    key: "K2".to_string()
                },
                Attempt {
                    backend: "gemini".to_string(),
                    model: "b".to_string(),
                    key: "K3".to_string()
                },
            ]
        );
    }

    #[test]
    fn mk_policy_round_robins_by_key_index() {
        let route = FailoverRoute {
            policy: RoutePolicy::Mk,
            elements: vec!["openrouter:a".to_string(), "gemini:b".to_string()],
        };
        let attempts = expand_route(&route, &keys());
        // i=0: openrouter/K1, gemini/K3; i=1: openrouter/K2 only (gemini has no 2nd key)
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].key, "K1");
        assert_eq!(attempts[1].key, "K3");
        assert_eq!(attempts[2].key, "K2");
    }

    struct AlwaysFails;
    #[async_trait::async_trait]
    impl AttemptExecutor for AlwaysFails {
        async fn execute(&self, _attempt: &Attempt) -> Result<ResponseEnvelope> {
            Err(ProxyError::RateLimit { retry_after: Some(5) })
        }
    }

    #[tokio::test]
    async fn all_rate_limited_surfaces_earliest_reset() {
        let limiter = RateLimiter::new(100, Duration::from_secs(60));
        let coordinator = FailoverCoordinator::new(&limiter);
        let attempts = vec![Attempt {
            backend: "openrouter".to_string(),
            model: "a".to_string(),
            key: "K1".to_string(),
        }];
        let result = coordinator.drive(&attempts, &AlwaysFails).await;
        assert!(matches!(result, Err(ProxyError::RateLimit { .. })));
    }
}
