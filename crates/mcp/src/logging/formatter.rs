//! Log formatting and redaction.

use anywhere_util::text_processing::get_redact_patterns;
use regex::{Captures, Regex};

use super::LogEntry;

/// Formats diagnostic entries as single lines with secrets redacted.
#[derive(Debug, Default)]
pub struct LogFormatter {
    redaction_rules: RedactionRules,
}

/// Rules for redacting sensitive information from diagnostic text.
#[derive(Debug)]
pub struct RedactionRules {
    patterns: Vec<Regex>,
    replacement: String,
}

impl LogFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(redaction_rules: RedactionRules) -> Self {
        Self { redaction_rules }
    }

    /// One-line rendering used for exports and the audit trail.
    pub fn format(&self, entry: &LogEntry) -> String {
        format!(
            "[{}] {} {} {}: {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.level,
            entry.source,
            entry.backend_id,
            self.redact_message(&entry.message)
        )
    }

    pub fn redact_message(&self, message: &str) -> String {
        self.redaction_rules.redact(message)
    }
}

impl RedactionRules {
    /// Default rules: the shared secret patterns plus `key: value` forms.
    pub fn new() -> Self {
        let mut patterns = get_redact_patterns().clone();
        if let Ok(pattern) = Regex::new(r"(?i)(api[\s_-]?key|auth[\s_-]?token|secret|password)\s*[:=]\s*([^\s,;]+)") {
            patterns.push(pattern);
        }
        Self {
            patterns,
            replacement: "[REDACTED]".to_string(),
        }
    }

    pub fn with_patterns(patterns: Vec<Regex>, replacement: String) -> Self {
        Self { patterns, replacement }
    }

    /// Replace the last capture group of every match, or the whole match
    /// when the pattern has no groups.
    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();
        for pattern in &self.patterns {
            result = pattern
                .replace_all(&result, |caps: &Captures| {
                    let (Some(full), Some(sensitive)) = (caps.get(0), caps.iter().flatten().last()) else {
                        return self.replacement.clone();
                    };
                    if caps.len() == 1 {
                        return self.replacement.clone();
                    }
                    let start = sensitive.start() - full.start();
                    let end = sensitive.end() - full.start();
                    let text = full.as_str();
                    format!("{}{}{}", &text[..start], self.replacement, &text[end..])
                })
                .to_string();
        }
        result
    }

    pub fn contains_sensitive(&self, text: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(text))
    }
}

impl Default for RedactionRules {
    fn default() -> Self {
        Self::new()
    }
}
