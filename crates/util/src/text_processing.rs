//! # Text Processing Utilities
//!
//! Redaction of secret-looking values in free text such as backend stderr,
//! command lines, and error details before they reach logs or clients.

use once_cell::sync::Lazy;
use regex::Regex;

/// Redacts values that look like secrets in a string.
///
/// Key names are preserved so the output stays useful for debugging.
///
/// # Example
/// ```rust
/// use anywhere_util::text_processing::redact_sensitive;
///
/// let redacted = redact_sensitive("API_KEY=abc123 TOKEN=xyz789");
/// assert_eq!(redacted, "API_KEY=[REDACTED] TOKEN=[REDACTED]");
///
/// let redacted = redact_sensitive("Authorization: Bearer secret123");
/// assert_eq!(redacted, "Authorization: Bearer [REDACTED]");
/// ```
pub fn redact_sensitive(input: &str) -> String {
    redact_sensitive_with(input, "[REDACTED]")
}

/// Redacts sensitive-looking values, using a custom replacement token.
pub fn redact_sensitive_with(input: &str, replacement: &str) -> String {
    let mut redacted = input.to_string();

    for pattern in get_redact_patterns().iter() {
        redacted = pattern
            .replace_all(&redacted, |captures: &regex::Captures| match (captures.get(1), captures.get(2)) {
                (Some(prefix), Some(_)) => format!("{}{}", prefix.as_str(), replacement),
                _ => replacement.to_string(),
            })
            .to_string();
    }

    redacted
}

/// Returns compiled regex patterns for detecting sensitive information.
///
/// Patterns with two capture groups keep the first group (the key or header
/// prefix) and replace the second. Patterns without groups replace the whole
/// match.
pub fn get_redact_patterns() -> &'static Vec<Regex> {
    static REDACT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(build_redact_patterns);

    &REDACT_PATTERNS
}

fn build_redact_patterns() -> Vec<Regex> {
    [
        r"(?i)(authorization:\s*(?:bearer\s+|basic\s+)?)([A-Za-z0-9\-._~+/=:]+)",
        r"(?i)(x-api-key:\s*)([^\s,;]+)",
        r#"(?i)(\b[A-Z0-9_]*(?:KEY|TOKEN|SECRET|PASSWORD)\s*[=:]\s*)([^\s,;"']+)"#,
        r"(?i)(\bbearer\s+)([A-Za-z0-9\-._~+/]+=*)",
        r"\b(?:ghp|gho|ghs|ghu)_[A-Za-z0-9]{20,}\b",
        r"\bsk-[A-Za-z0-9_-]{20,}\b",
        r"\beyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+",
    ]
    .into_iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_env_style_assignments() {
        let redacted = redact_sensitive("GITHUB_TOKEN=ghp_abc DEBUG=1");
        assert_eq!(redacted, "GITHUB_TOKEN=[REDACTED] DEBUG=1");
    }

    #[test]
    fn redacts_bare_provider_tokens() {
        let redacted = redact_sensitive("using ghp_0123456789abcdefghijABCD for auth");
        assert_eq!(redacted, "using [REDACTED] for auth");
    }

    #[test]
    fn leaves_plain_text_alone() {
        let line = "npm WARN deprecated inflight@1.0.6";
        assert_eq!(redact_sensitive(line), line);
    }

    #[test]
    fn custom_replacement_is_used() {
        let redacted = redact_sensitive_with("x-api-key: hunter2", "***");
        assert_eq!(redacted, "x-api-key: ***");
    }
}
