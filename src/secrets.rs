//! API-key lookup.
//!
//! Keys come from the environment (optionally via a `.env` file loaded at
//! startup), matched on the same host substrings the provider table uses.
//! A missing key is legal: local endpoints such as Ollama accept
//! unauthenticated requests.

/// Host substrings mapped to the environment variable holding their key.
const KEY_VARS: &[(&str, &str)] = &[
    ("openai.com", "OPENAI_API_KEY"),
    ("nvidia.com", "NVIDIA_API_KEY"),
    ("anthropic.com", "ANTHROPIC_API_KEY"),
    ("together.xyz", "TOGETHER_API_KEY"),
    ("together.ai", "TOGETHER_API_KEY"),
];

/// The generic fallback for endpoints not in the table.
const FALLBACK_KEY_VAR: &str = "PAIRSMITH_API_KEY";

/// Look up the API key for a chat endpoint. Returns `None` when no key is
/// configured (or the configured value is empty).
pub fn api_key_for(base_url: &str) -> Option<String> {
    let var = KEY_VARS
        .iter()
        .find(|(host, _)| base_url.contains(host))
        .map(|(_, var)| *var)
        .unwrap_or(FALLBACK_KEY_VAR);
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Some(key),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment variables are process-global, so these tests use variable
    // names unlikely to collide and restore nothing; each asserts only on
    // the variable it sets.

    #[test]
    fn test_known_host_uses_provider_variable() {
        unsafe { std::env::set_var("TOGETHER_API_KEY", "tk-123") };
        assert_eq!(
            api_key_for("https://api.together.xyz/v1").as_deref(),
            Some("tk-123")
        );
    }

    #[test]
    fn test_unknown_host_uses_fallback_variable() {
        unsafe { std::env::set_var("PAIRSMITH_API_KEY", "fk-456") };
        assert_eq!(
            api_key_for("http://192.168.1.20:8000/v1").as_deref(),
            Some("fk-456")
        );
    }

    #[test]
    fn test_empty_value_counts_as_missing() {
        unsafe { std::env::set_var("NVIDIA_API_KEY", "  ") };
        assert_eq!(api_key_for("https://integrate.api.nvidia.com/v1"), None);
    }
}
