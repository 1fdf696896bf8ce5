//! Descriptor validation.
//!
//! Backend ids are namespace prefixes joined to native names with `_`, so an
//! id containing `_` would make dispatch ambiguous. Ids are checked here, at
//! load time, instead of at routing time.

use std::collections::HashSet;

use anywhere_types::{BackendDescriptor, NAMESPACE_SEPARATOR, RuntimeKind};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::gateway::LOCAL_TOOL_NAMES;

static BACKEND_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("backend id regex should compile"));

static ENV_KEY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env key regex should compile"));

/// Validate a full descriptor set.
pub fn validate_descriptors(descriptors: &[BackendDescriptor]) -> Result<(), ValidationError> {
    let mut ids = HashSet::new();
    let mut active_names = HashSet::new();
    for descriptor in descriptors {
        validate_descriptor(descriptor)?;
        if !ids.insert(descriptor.id.as_str()) {
            return Err(ValidationError::DuplicateId { id: descriptor.id.clone() });
        }
        if descriptor.active && !active_names.insert(descriptor.name.as_str()) {
            return Err(ValidationError::DuplicateName {
                name: descriptor.name.clone(),
            });
        }
        debug!("Validated backend descriptor: {}", descriptor.id);
    }
    Ok(())
}

/// Validate a backend id.
pub fn validate_backend_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::InvalidBackendId {
            id: id.to_string(),
            reason: "Backend id cannot be empty".to_string(),
        });
    }

    if id.contains(NAMESPACE_SEPARATOR) {
        return Err(ValidationError::InvalidBackendId {
            id: id.to_string(),
            reason: format!("Backend id cannot contain '{NAMESPACE_SEPARATOR}', it separates the id from tool names"),
        });
    }

    if !BACKEND_ID_REGEX.is_match(id) {
        return Err(ValidationError::InvalidBackendId {
            id: id.to_string(),
            reason: "Backend id must contain only lowercase letters, numbers and hyphens".to_string(),
        });
    }

    let prefix = format!("{id}{NAMESPACE_SEPARATOR}");
    if let Some(local) = LOCAL_TOOL_NAMES.iter().find(|name| name.starts_with(&prefix)) {
        return Err(ValidationError::InvalidBackendId {
            id: id.to_string(),
            reason: format!("Backend id would shadow the gateway tool '{local}'"),
        });
    }

    Ok(())
}

/// Validate one descriptor in isolation.
pub fn validate_descriptor(descriptor: &BackendDescriptor) -> Result<(), ValidationError> {
    validate_backend_id(&descriptor.id)?;

    if descriptor.name.trim().is_empty() {
        return Err(ValidationError::MissingRequiredField {
            id: descriptor.id.clone(),
            field: "name".to_string(),
        });
    }

    match &descriptor.endpoint {
        None => {
            let has_start = descriptor
                .start_command
                .as_deref()
                .is_some_and(|command| !command.trim().is_empty());
            if !has_start {
                return Err(ValidationError::MissingRequiredField {
                    id: descriptor.id.clone(),
                    field: "startCommand".to_string(),
                });
            }
        }
        Some(endpoint) => {
            let scheme = endpoint.url.scheme();
            if scheme != "http" && scheme != "https" {
                return Err(ValidationError::InvalidEndpoint {
                    id: descriptor.id.clone(),
                    reason: format!("Unsupported URL scheme: {scheme} (expected http/https)"),
                });
            }
            for name in endpoint.headers.keys() {
                validate_header_name(name)?;
            }
        }
    }

    let has_install = descriptor
        .install_command
        .as_deref()
        .is_some_and(|command| !command.trim().is_empty());
    if descriptor.runtime == RuntimeKind::Container && has_install {
        return Err(ValidationError::UnsupportedField {
            id: descriptor.id.clone(),
            field: "installCommand".to_string(),
            reason: "container backends run a prebuilt image and have no install step".to_string(),
        });
    }

    for binding in &descriptor.env {
        validate_env_key(&binding.key)?;
    }

    Ok(())
}

fn validate_env_key(key: &str) -> Result<(), ValidationError> {
    if !ENV_KEY_REGEX.is_match(key) {
        return Err(ValidationError::InvalidEnvKey {
            key: key.to_string(),
            reason: "Environment variable keys must start with a letter or underscore, followed by letters, numbers, or underscores"
                .to_string(),
        });
    }
    Ok(())
}

fn validate_header_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.chars().any(|c| c.is_control() || c.is_whitespace() || c == ':') {
        return Err(ValidationError::InvalidHeaderName {
            name: name.to_string(),
            reason: "Header names must be non-empty tokens without whitespace, colons or control characters".to_string(),
        });
    }
    Ok(())
}

/// Errors that can occur during validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid backend id '{id}': {reason}")]
    InvalidBackendId { id: String, reason: String },

    #[error("Duplicate backend id '{id}'")]
    DuplicateId { id: String },

    #[error("Duplicate active backend name '{name}'")]
    DuplicateName { name: String },

    #[error("Backend '{id}' is missing required field '{field}'")]
    MissingRequiredField { id: String, field: String },

    #[error("Backend '{id}' has an invalid endpoint: {reason}")]
    InvalidEndpoint { id: String, reason: String },

    #[error("Backend '{id}' cannot use '{field}': {reason}")]
    UnsupportedField { id: String, field: String, reason: String },

    #[error("Invalid environment variable key '{key}': {reason}")]
    InvalidEnvKey { key: String, reason: String },

    #[error("Invalid HTTP header name '{name}': {reason}")]
    InvalidHeaderName { name: String, reason: String },
}
