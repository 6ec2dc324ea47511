//! Provider identity derived from endpoint URLs.
//!
//! Provider-level rate limits and API keys are keyed by a short provider
//! name rather than the full endpoint URL, so that several models served
//! from the same host share one budget.

/// Host substrings mapped to provider names. Checked in order; first match
/// wins. Anything unrecognized falls back to the verbatim base URL.
const PROVIDER_HOSTS: &[(&str, &str)] = &[
    ("openai.com", "openai"),
    ("nvidia.com", "nvidia"),
    ("anthropic.com", "anthropic"),
    ("together.xyz", "together"),
    ("together.ai", "together"),
];

/// The provider name for a chat endpoint.
pub fn provider_for(base_url: &str) -> &str {
    for (host, name) in PROVIDER_HOSTS {
        if base_url.contains(host) {
            return name;
        }
    }
    base_url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_hosts() {
        assert_eq!(provider_for("https://api.openai.com/v1"), "openai");
        assert_eq!(provider_for("https://integrate.api.nvidia.com/v1"), "nvidia");
        assert_eq!(provider_for("https://api.anthropic.com/v1"), "anthropic");
        assert_eq!(provider_for("https://api.together.xyz/v1"), "together");
        assert_eq!(provider_for("https://api.together.ai/v1"), "together");
    }

    #[test]
    fn test_unknown_host_falls_back_to_url() {
        assert_eq!(
            provider_for("http://localhost:11434/v1"),
            "http://localhost:11434/v1"
        );
    }
}
