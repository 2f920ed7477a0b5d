//! Model types
//!
//! Defines catalog entries and locally installed model metadata.

use serde::{Deserialize, Serialize};

/// Entry of the installable model catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCard {
    /// Display name of the model
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub license: String,
    /// Repository URL the weights are fetched from
    pub server: String,
    /// Weight file fetched from `server` by `install_model`
    pub filename: String,
    /// Expected SHA-256 of `filename`, checked after download
    #[serde(default)]
    pub sha256: Option<String>,
}

/// A model found in the personal models directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalModel {
    /// Directory entry name
    pub name: String,
    /// Absolute path of the entry
    pub path: String,
    /// Size in bytes (sum of files for a directory)
    pub size_bytes: u64,
}
