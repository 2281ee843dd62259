/// Built-in model list returned by `GET /models` when an adapter's
/// `get_available_models()` call fails (spec.md §6: the endpoint always
/// answers 200, never 500, falling back to a static default).
pub fn fallback_models(backend: &str) -> Vec<String> {
    match backend {
        "openai" => vec![
            "gpt-4o".to_string(),
            "gpt-4o-mini".to_string(),
            "gpt-4-turbo".to_string(),
            "o1".to_string(),
            "o1-mini".to_string(),
        ],
        "anthropic" => vec![
            "claude-opus-4-1".to_string(),
            "claude-sonnet-4-5".to_string(),
            "claude-3-5-haiku".to_string(),
        ],
        "openrouter" => vec![
            "openrouter/auto".to_string(),
            "meta-llama/llama-3.1-70b-instruct".to_string(),
        ],
        "gemini" => vec!["gemini-1.5-pro".to_string(), "gemini-1.5-flash".to_string()],
        _ => vec!["default-model".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_still_returns_a_nonempty_list() {
        assert!(!fallback_models("made-up-backend").is_empty());
    }

    #[test]
    fn known_backends_return_their_curated_list() {
        assert!(fallback_models("anthropic").contains(&"claude-opus-4-1".to_string()));
    }
}
