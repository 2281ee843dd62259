use std::collections::HashMap;

use super::SessionId;

/// The request-scoped context the resolver needs to find a stable session id
/// (spec.md §4.2). Transport layers populate this from headers/cookies; the
/// core never parses HTTP itself.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub session_id_field: Option<String>,
    pub extra_session_id: Option<String>,
    pub header_session_id: Option<String>,
    pub cookie_session_id: Option<String>,
    /// Set by the resolver the first time it generates an id, so repeated
    /// lookups within one request are stable (spec.md §4.2).
    pub generated_session_id: Option<String>,
    pub agent: Option<String>,
    pub extra: HashMap<String, String>,
}

/// Resolves a stable session id with the priority order from spec.md §4.2:
/// domain request field, then `extra.session_id`, then header, then cookie,
/// then a freshly generated id cached on the context.
pub struct SessionResolver {
    generated_prefix: String,
}

impl SessionResolver {
    pub fn new(generated_prefix: impl Into<String>) -> Self {
        Self {
            generated_prefix: generated_prefix.into(),
        }
    }

    pub fn resolve(&self, ctx: &mut RequestContext) -> SessionId {
        if let Some(id) = &ctx.session_id_field {
            return SessionId(id.clone());
        }
        if let Some(id) = &ctx.extra_session_id {
            return SessionId(id.clone());
        }
        if let Some(id) = &ctx.header_session_id {
            return SessionId(id.clone());
        }
        if let Some(id) = &ctx.cookie_session_id {
            return SessionId(id.clone());
        }
        if let Some(id) = &ctx.generated_session_id {
            return SessionId(id.clone());
        }
        let generated = SessionId::generate(&self.generated_prefix);
        ctx.generated_session_id = Some(generated.as_str().to_string());
        generated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_is_honored() {
        let resolver = SessionResolver::new("proxy");
        let mut ctx = RequestContext {
            header_session_id: Some("from-header".to_string()),
            cookie_session_id: Some("from-cookie".to_string()),
            ..Default::default()
        };
        assert_eq!(resolver.resolve(&mut ctx).as_str(), "from-header");

        let mut ctx2 = RequestContext {
            cookie_session_id: Some("from-cookie".to_string()),
            ..Default::default()
        };
        assert_eq!(resolver.resolve(&mut ctx2).as_str(), "from-cookie");
    }

    #[test]
    fn generated_id_is_stable_within_request() {
        let resolver = SessionResolver::new("proxy");
        let mut ctx = RequestContext::default();
        let first = resolver.resolve(&mut ctx);
        let second = resolver.resolve(&mut ctx);
        assert_eq!(first, second);
        assert!(first.as_str().starts_with("proxy-"));
    }
}
