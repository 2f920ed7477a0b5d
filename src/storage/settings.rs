//! Binding settings storage
//!
//! Declares the binding's configuration entries and persists them as JSON.

use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const MIN_CTX_SIZE: u32 = 512;
pub const MAX_COMPRESS_POS_EMB: u32 = 8;
pub const MAX_ALPHA: u32 = 32;

/// Binding settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingSettings {
    /// Context size in tokens. It depends on the model; a wrong value gives
    /// bad outputs.
    pub ctx_size: u32,
    /// Positional embedding compression, ctx_size / 2048 when extending past
    /// 2048. Set this or `alpha`, not both.
    pub compress_pos_emb: u32,
    /// NTK alpha for context extension. Set this or `compress_pos_emb`.
    pub alpha: u32,
    /// Number of layers to offload to GPU (0 = CPU only)
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: u32,
    /// Selected model, relative to the models directory
    #[serde(default)]
    pub model_name: Option<String>,
}

fn default_gpu_layers() -> u32 {
    99
}

impl Default for BindingSettings {
    fn default() -> Self {
        Self {
            ctx_size: 8192,
            compress_pos_emb: 1,
            alpha: 1,
            gpu_layers: default_gpu_layers(),
            model_name: None,
        }
    }
}

impl BindingSettings {
    /// Clamp every entry into its declared range
    pub fn validate(&mut self) {
        self.ctx_size = self.ctx_size.max(MIN_CTX_SIZE);
        self.compress_pos_emb = self.compress_pos_emb.clamp(1, MAX_COMPRESS_POS_EMB);
        self.alpha = self.alpha.clamp(1, MAX_ALPHA);

        if self.compress_pos_emb > 1 && self.alpha > 1 {
            tracing::warn!(
                "Both compress_pos_emb ({}) and alpha ({}) are set; only one should be used",
                self.compress_pos_emb,
                self.alpha
            );
        }

        if self
            .model_name
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            self.model_name = None;
        }
    }
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings(path: &Path) -> BindingSettings {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load binding settings, using defaults: {}", e);
            BindingSettings::default()
        }
    }
}

fn load_settings_internal(path: &Path) -> Result<BindingSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Binding settings not found, using defaults");
        return Ok(BindingSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: BindingSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded binding settings from {:?}", path);
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(path: &Path, settings: &BindingSettings) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved binding settings to {:?}", path);
    Ok(())
}
