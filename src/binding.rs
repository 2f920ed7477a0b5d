//! Host-facing binding
//!
//! Owns the settings, the loaded model and the directory layout, and exposes
//! the operations a host application drives: install, model selection,
//! downloads and streamed generation.

use std::fs;
use std::path::{Path, PathBuf};

use crate::inference::{
    resolve_model_file, Detokenizer, EngineError, GenerationParams, InferenceBackend, LlamaCppBackend,
    StreamDecoder, StreamStatus,
};
use crate::storage::catalog::load_catalog;
use crate::storage::huggingface::{DownloadError, HubClient, HubRepo};
use crate::storage::settings::{load_settings, save_settings, BindingSettings};
use crate::storage::{BindingPaths, StorageError};
use crate::system::{detect_gpu, GpuInfo};
use crate::types::{InstallOption, LocalModel, MessageType, ModelCard, Token};

/// A quantized-model binding
pub struct Binding<B: InferenceBackend = LlamaCppBackend> {
    settings: BindingSettings,
    paths: BindingPaths,
    backend: Option<B>,
    hub: Option<HubClient>,
}

impl<B: InferenceBackend> Binding<B> {
    /// Build a binding, running the installation when `install_option` asks
    /// for it. No model is loaded until [`Binding::build_model`].
    pub fn new(
        mut settings: BindingSettings,
        paths: BindingPaths,
        install_option: InstallOption,
    ) -> Result<Self, StorageError> {
        settings.validate();
        let binding = Self {
            settings,
            paths,
            backend: None,
            hub: None,
        };

        if install_option.should_install(binding.paths.is_installed()) {
            binding.install()?;
        }
        Ok(binding)
    }

    /// Build a binding from the settings persisted under `paths`
    pub fn from_paths(paths: BindingPaths, install_option: InstallOption) -> Result<Self, StorageError> {
        let settings = load_settings(&paths.binding_config_path());
        Self::new(settings, paths, install_option)
    }

    /// Wrap an already loaded backend
    pub fn with_backend(settings: BindingSettings, paths: BindingPaths, backend: B) -> Self {
        Self {
            settings,
            paths,
            backend: Some(backend),
            hub: None,
        }
    }

    /// Use `hub` for downloads instead of the public endpoint
    pub fn with_hub(mut self, hub: HubClient) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn settings(&self) -> &BindingSettings {
        &self.settings
    }

    /// Replace the settings. Takes effect on the next [`Binding::build_model`].
    pub fn update_settings(&mut self, mut settings: BindingSettings) -> Result<(), StorageError> {
        settings.validate();
        save_settings(&self.paths.binding_config_path(), &settings)?;
        self.settings = settings;
        Ok(())
    }

    pub fn paths(&self) -> &BindingPaths {
        &self.paths
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend(&self) -> Option<&B> {
        self.backend.as_ref()
    }

    /// Load the selected model, replacing any loaded one.
    ///
    /// On failure no model stays loaded.
    pub fn build_model(&mut self) -> Result<(), EngineError> {
        self.backend = None;

        let Some(model_name) = self.settings.model_name.as_deref() else {
            tracing::error!("No model selected");
            return Err(EngineError::Configuration("No model selected".into()));
        };

        let model_path = resolve_model_file(&self.paths.models_dir(), model_name).map_err(|e| {
            tracing::error!("Model {} is not available: {}", model_name, e);
            EngineError::Configuration(format!("Model {} is not available: {}", model_name, e))
        })?;

        let backend = B::load(&model_path, &self.settings)?;
        tracing::info!("Model {} ready ({} tokens of context)", model_name, backend.context_size());
        self.backend = Some(backend);
        Ok(())
    }

    pub fn tokenize(&self, prompt: &str) -> Result<Vec<Token>, EngineError> {
        self.backend
            .as_ref()
            .ok_or(EngineError::NotLoaded)?
            .tokenize(prompt)
    }

    pub fn detokenize(&self, tokens: &[Token]) -> Result<String, EngineError> {
        self.backend
            .as_ref()
            .ok_or(EngineError::NotLoaded)?
            .tokenizer()
            .detokenize(tokens)
    }

    /// Generate up to `n_predict` tokens after `prompt`.
    ///
    /// `callback` receives every printable chunk with [`MessageType::Chunk`];
    /// returning `false` stops generation. It is finally called once with the
    /// whole text and [`MessageType::Full`]. Returns the whole text.
    pub fn generate<F>(
        &mut self,
        prompt: &str,
        n_predict: u32,
        mut callback: F,
        params: &GenerationParams,
    ) -> Result<String, EngineError>
    where
        F: FnMut(&str, MessageType) -> bool,
    {
        let backend = self.backend.as_mut().ok_or(EngineError::NotLoaded)?;

        let mut params = params.clone();
        params.validate();

        let prompt_tokens = backend.tokenize(prompt)?;
        tracing::debug!("Prompt is {} tokens, predicting up to {}", prompt_tokens.len(), n_predict);

        let mut decoder = StreamDecoder::new(backend.tokenizer(), true, &mut callback);
        let result = {
            let mut on_step =
                |tokens: &[Token]| -> Result<StreamStatus, EngineError> { Ok(decoder.feed(tokens)?) };
            backend.generate(&prompt_tokens, n_predict, &params, &mut on_step)
        };

        match result {
            Ok(generated) => tracing::debug!("Generated {} tokens", generated.len()),
            Err(e) => {
                tracing::error!("Couldn't generate: {}", e);
                return Err(e);
            }
        }

        decoder.finish()?;
        let output = decoder.into_output();
        callback(&output, MessageType::Full);
        Ok(output)
    }

    /// First-use setup: detect the GPU, create the models directory and
    /// persist the settings.
    pub fn install(&self) -> Result<GpuInfo, StorageError> {
        tracing::info!("Installing binding under {:?}", self.paths.root);

        let gpu = detect_gpu();
        if gpu.is_available {
            tracing::info!(
                "Found {} GPU: {} ({} MB)",
                gpu.backend,
                gpu.name,
                gpu.vram_total_mb
            );
            if !gpu.backend.is_compiled_in() {
                tracing::warn!(
                    "This build has no {} support; layers will run on the CPU",
                    gpu.backend
                );
            }
        } else {
            tracing::warn!("No GPU found, inference will run on the CPU");
        }

        fs::create_dir_all(self.paths.models_dir())?;
        save_settings(&self.paths.binding_config_path(), &self.settings)?;
        fs::write(self.paths.install_marker(), env!("CARGO_PKG_VERSION"))?;

        tracing::info!("Installation done");
        Ok(gpu)
    }

    /// Remove the installation marker and binding configuration.
    /// Downloaded models are kept.
    pub fn uninstall(&self) -> Result<(), StorageError> {
        for path in [self.paths.install_marker(), self.paths.binding_config_path()] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        tracing::info!("Binding uninstalled");
        Ok(())
    }

    /// Models present in the models directory
    pub fn list_models(&self) -> Result<Vec<LocalModel>, StorageError> {
        let models_dir = self.paths.models_dir();
        if !models_dir.exists() {
            return Ok(Vec::new());
        }

        let mut models = Vec::new();
        for entry in fs::read_dir(&models_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name.ends_with(".tmp") {
                continue;
            }

            let path = entry.path();
            let size_bytes = if path.is_dir() {
                fs::read_dir(&path)?
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.metadata().ok())
                    .filter(|m| m.is_file())
                    .map(|m| m.len())
                    .sum()
            } else {
                entry.metadata()?.len()
            };

            models.push(LocalModel {
                name,
                path: path.to_string_lossy().to_string(),
                size_bytes,
            });
        }

        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    /// Models that can be installed
    pub fn get_available_models(&self) -> Result<Vec<ModelCard>, StorageError> {
        load_catalog(&self.paths.catalog_path())
    }

    fn hub(&self) -> Result<HubClient, DownloadError> {
        match &self.hub {
            Some(hub) => Ok(hub.clone()),
            None => HubClient::new(),
        }
    }

    /// Download the repository at `url` into `<models dir>/<repo name>`.
    ///
    /// A URL naming a single file (`.../resolve/<rev>/<file>`) fetches only
    /// that file and selects it as the model.
    pub async fn download_model(
        &mut self,
        url: &str,
        progress: impl Fn(u64, u64) + Send + Sync,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        let repo = HubRepo::parse(url)?;
        let dest = self.paths.models_dir().join(repo.name());
        let paths = self.hub()?.download_model(&repo, &dest, progress).await?;

        if repo.file.is_some() {
            if let Some(path) = paths.first() {
                self.select_model_file(path)?;
            }
        }
        Ok(paths)
    }

    /// Fetch the weight file of a catalog entry and select it as the model.
    ///
    /// The file is checked against the entry's SHA-256 when it has one.
    pub async fn install_model(
        &mut self,
        card: &ModelCard,
        progress: impl Fn(u64, u64) + Send + Sync,
    ) -> Result<PathBuf, DownloadError> {
        let repo = HubRepo::parse(&card.server)?.with_file(card.filename.clone());
        let dest = self.paths.models_dir().join(repo.name());
        let hub = self.hub()?;

        tracing::info!("Installing {} from {}", card.name, repo.repo_id);
        let path = match card.sha256.as_deref() {
            Some(sha256) => hub.download_verified(&repo, &dest, sha256, progress).await?,
            None => hub
                .download_model(&repo, &dest, progress)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| DownloadError::NoFiles(repo.repo_id.clone()))?,
        };

        self.select_model_file(&path)?;
        Ok(path)
    }

    /// Persist `path` as the selected model, relative to the models directory
    fn select_model_file(&mut self, path: &Path) -> Result<(), StorageError> {
        let models_dir = self.paths.models_dir();
        let relative = path.strip_prefix(&models_dir).unwrap_or(path);

        let mut settings = self.settings.clone();
        settings.model_name = Some(relative.to_string_lossy().replace('\\', "/"));
        tracing::info!("Selected model {:?}", settings.model_name);
        self.update_settings(settings)
    }

    /// Size of the weights behind `url`
    pub async fn get_file_size(&self, url: &str) -> Result<u64, DownloadError> {
        let repo = HubRepo::parse(url)?;
        self.hub()?.get_file_size(&repo).await
    }
}
