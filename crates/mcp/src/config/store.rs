//! Read-only sources of backend descriptors.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anywhere_types::BackendDescriptor;
use async_trait::async_trait;

use crate::config::{ConfigError, FileFormat, parse_descriptor_file, validate_descriptors};

/// Read interface over the descriptor store. The gateway never writes to it.
#[async_trait]
pub trait DescriptorStore: Send + Sync {
    /// Ordered list of active descriptors.
    async fn active_descriptors(&self) -> Result<Vec<BackendDescriptor>, ConfigError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Descriptor file on disk, re-read on every refresh.
#[derive(Debug, Clone)]
pub struct FileDescriptorStore {
    path: PathBuf,
}

impl FileDescriptorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DescriptorStore for FileDescriptorStore {
    async fn active_descriptors(&self) -> Result<Vec<BackendDescriptor>, ConfigError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let descriptors = parse_descriptor_file(&content, FileFormat::from_path(&self.path))?;
        Ok(descriptors.into_iter().filter(|descriptor| descriptor.active).collect())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory store, used by embedders and tests.
#[derive(Debug, Default)]
pub struct StaticDescriptorStore {
    descriptors: RwLock<Vec<BackendDescriptor>>,
}

impl StaticDescriptorStore {
    pub fn new(descriptors: Vec<BackendDescriptor>) -> Result<Self, ConfigError> {
        validate_descriptors(&descriptors)?;
        Ok(Self {
            descriptors: RwLock::new(descriptors),
        })
    }

    /// Replaces the stored descriptor set; takes effect on the next refresh.
    pub fn replace(&self, descriptors: Vec<BackendDescriptor>) -> Result<(), ConfigError> {
        validate_descriptors(&descriptors)?;
        let mut guard = self
            .descriptors
            .write()
            .map_err(|_| ConfigError::Invalid {
                message: "descriptor store lock poisoned".to_string(),
            })?;
        *guard = descriptors;
        Ok(())
    }
}

#[async_trait]
impl DescriptorStore for StaticDescriptorStore {
    async fn active_descriptors(&self) -> Result<Vec<BackendDescriptor>, ConfigError> {
        let guard = self.descriptors.read().map_err(|_| ConfigError::Invalid {
            message: "descriptor store lock poisoned".to_string(),
        })?;
        Ok(guard.iter().filter(|descriptor| descriptor.active).cloned().collect())
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anywhere_types::RuntimeKind;
    use std::io::Write;

    #[tokio::test]
    async fn file_store_filters_inactive_descriptors() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"backends":[
                {{"id":"alpha","name":"Alpha","runtime":"npx","startCommand":"a"}},
                {{"id":"beta","name":"Beta","runtime":"uvx","startCommand":"b","active":false}}
            ]}}"#
        )
        .unwrap();

        let store = FileDescriptorStore::new(file.path());
        let active = store.active_descriptors().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "alpha");
    }

    #[tokio::test]
    async fn missing_file_yields_no_backends() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileDescriptorStore::new(dir.path().join("absent.json"));
        assert!(store.active_descriptors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn static_store_replacement_is_validated() {
        let store = StaticDescriptorStore::new(vec![BackendDescriptor::new("alpha", RuntimeKind::ProcessJs, "a")]).unwrap();
        let bad = BackendDescriptor::new("bad_id", RuntimeKind::ProcessJs, "a");
        assert!(store.replace(vec![bad]).is_err());
        assert_eq!(store.active_descriptors().await.unwrap().len(), 1);
    }
}
