//! Persistent storage
//!
//! This module handles binding configuration, data directories, the model
//! catalog and model downloads.

pub mod catalog;
pub mod huggingface;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Could not determine a data directory")]
    NoDataDir,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Platform data directory of the binding
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    ProjectDirs::from("", "", "quant-binding")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}

/// Directory layout used by a binding instance
#[derive(Debug, Clone)]
pub struct BindingPaths {
    pub root: PathBuf,
    /// Models owned by the user, shared between bindings
    pub personal_models_path: PathBuf,
    pub configs_path: PathBuf,
}

impl BindingPaths {
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            personal_models_path: root.join("models"),
            configs_path: root.join("configs"),
            root,
        }
    }

    /// Layout under the platform data directory
    pub fn discover() -> Result<Self, StorageError> {
        Ok(Self::from_root(get_data_dir()?))
    }

    /// Where this binding keeps its GGUF models
    pub fn models_dir(&self) -> PathBuf {
        self.personal_models_path.join("gguf")
    }

    pub fn binding_config_path(&self) -> PathBuf {
        self.configs_path.join("binding.json")
    }

    /// Optional catalog overriding the built-in one
    pub fn catalog_path(&self) -> PathBuf {
        self.configs_path.join("models.json")
    }

    pub fn install_marker(&self) -> PathBuf {
        self.configs_path.join(".installed")
    }

    pub fn is_installed(&self) -> bool {
        self.install_marker().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = BindingPaths::from_root("/data");
        assert_eq!(paths.models_dir(), PathBuf::from("/data/models/gguf"));
        assert_eq!(
            paths.binding_config_path(),
            PathBuf::from("/data/configs/binding.json")
        );
        assert_eq!(paths.install_marker(), PathBuf::from("/data/configs/.installed"));
    }

    #[test]
    fn test_not_installed_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let paths = BindingPaths::from_root(dir.path());
        assert!(!paths.is_installed());
    }
}
