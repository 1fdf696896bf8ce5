//! Descriptor file IO.

use std::env;
use std::path::{Path, PathBuf};

use anywhere_types::BackendDescriptor;
use anywhere_util::expand_tilde;
use dirs_next::config_dir;

use crate::config::{ConfigError, DescriptorFile, validate_descriptors};

/// Environment variable that overrides the descriptor file location.
pub const DESCRIPTORS_PATH_ENV: &str = "MCP_ANYWHERE_DESCRIPTORS";

/// Serialization format of a descriptor file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Yaml,
}

impl FileFormat {
    /// YAML for `.yaml`/`.yml`, JSON otherwise.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|extension| extension.to_str()) {
            Some(extension) if extension.eq_ignore_ascii_case("yaml") || extension.eq_ignore_ascii_case("yml") => FileFormat::Yaml,
            _ => FileFormat::Json,
        }
    }
}

/// Returns the default path of the descriptor file.
pub fn default_descriptor_path() -> PathBuf {
    if let Ok(path) = env::var(DESCRIPTORS_PATH_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mcp-anywhere")
        .join("backends.json")
}

/// Parses and validates descriptor file content.
pub fn parse_descriptor_file(content: &str, format: FileFormat) -> Result<Vec<BackendDescriptor>, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: DescriptorFile = match format {
        FileFormat::Json => serde_json::from_str(content)?,
        FileFormat::Yaml => serde_yaml::from_str(content)?,
    };
    validate_descriptors(&file.backends)?;
    Ok(file.backends)
}

/// Loads every descriptor (active or not) from `path`. A missing file is empty.
pub fn load_descriptors_from_path(path: &Path) -> Result<Vec<BackendDescriptor>, ConfigError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_descriptor_file(&content, FileFormat::from_path(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_path_honors_environment_override() {
        let override_path = "~/custom/mcp-anywhere/backends.yaml";
        temp_env::with_var(DESCRIPTORS_PATH_ENV, Some(override_path), || {
            assert_eq!(default_descriptor_path(), expand_tilde(override_path));
        });
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let descriptors = load_descriptors_from_path(Path::new("/definitely/not/here.json")).unwrap();
        assert!(descriptors.is_empty());
    }

    #[test]
    fn loads_yaml_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "backends:\n  - id: alpha\n    name: Alpha\n    runtime: npx\n    startCommand: npx -y alpha-server\n"
        )
        .unwrap();

        let descriptors = load_descriptors_from_path(file.path()).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].id, "alpha");
    }

    #[test]
    fn invalid_ids_fail_the_whole_file() {
        let content = r#"{"backends":[{"id":"my_server","name":"x","runtime":"npx","startCommand":"x"}]}"#;
        let error = parse_descriptor_file(content, FileFormat::Json).unwrap_err();
        assert!(matches!(error, ConfigError::Validation(_)));
    }
}
