//! `${env:NAME}` interpolation for environment bindings and headers.

use anywhere_types::EnvBinding;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

static ENV_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{env:([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex should compile"));

/// Interpolate `${env:NAME}` placeholders from the process environment.
pub fn interpolate_string(value: &str) -> Result<String, InterpolationError> {
    interpolate_with(value, |name| std::env::var(name).ok())
}

/// Interpolate placeholders using `lookup` to resolve variable names.
pub fn interpolate_with(value: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String, InterpolationError> {
    let mut result = String::with_capacity(value.len());
    let mut last_end = 0;
    for captures in ENV_PLACEHOLDER.captures_iter(value) {
        let (Some(placeholder), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let resolved = lookup(name.as_str()).ok_or_else(|| InterpolationError::MissingEnvVar {
            name: name.as_str().to_string(),
        })?;
        debug!("Interpolated env var: {} -> [REDACTED]", name.as_str());
        result.push_str(&value[last_end..placeholder.start()]);
        result.push_str(&resolved);
        last_end = placeholder.end();
    }
    result.push_str(&value[last_end..]);
    Ok(result)
}

/// Resolve descriptor bindings into the environment injected into a session.
///
/// Optional bindings that resolve to nothing are left out. A required binding
/// that resolves to nothing is an error.
pub fn resolve_env_bindings(bindings: &[EnvBinding]) -> Result<IndexMap<String, String>, InterpolationError> {
    let mut resolved = IndexMap::new();
    for binding in bindings {
        let outcome = match &binding.value {
            None => Err("no value configured".to_string()),
            Some(raw) => match interpolate_string(raw) {
                Ok(value) if value.is_empty() => Err("value is empty".to_string()),
                Ok(value) => Ok(value),
                Err(InterpolationError::MissingEnvVar { name }) => Err(format!("environment variable {name} is not set")),
                Err(other) => return Err(other),
            },
        };

        match outcome {
            Ok(value) => {
                resolved.insert(binding.key.clone(), value);
            }
            Err(reason) if binding.required => {
                return Err(InterpolationError::MissingRequiredBinding {
                    key: binding.key.clone(),
                    reason,
                });
            }
            Err(reason) => debug!("Skipping optional binding {}: {}", binding.key, reason),
        }
    }
    Ok(resolved)
}

/// Interpolate every header value; unresolved headers are an error.
pub fn resolve_headers(headers: &IndexMap<String, String>) -> Result<IndexMap<String, String>, InterpolationError> {
    headers
        .iter()
        .map(|(name, value)| Ok((name.clone(), interpolate_string(value)?)))
        .collect()
}

/// Errors that can occur during interpolation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InterpolationError {
    #[error("Missing environment variable: {name}")]
    MissingEnvVar { name: String },

    #[error("Required binding {key} is unresolved: {reason}")]
    MissingRequiredBinding { key: String, reason: String },
}
