//! Inference backend seam
//!
//! The binding drives any backend through [`InferenceBackend`]; the streaming
//! decoder only needs a [`Detokenizer`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::inference::model::ModelError;
use crate::inference::streaming::{StreamError, StreamStatus};
use crate::storage::settings::BindingSettings;
use crate::types::Token;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("No model loaded")]
    NotLoaded,
    #[error("Tokenization failed: {0}")]
    Tokenize(String),
    #[error("Detokenization failed: {0}")]
    Detokenize(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Prompt + max tokens ({requested}) exceeds context window ({available})")]
    ContextOverflow { requested: usize, available: usize },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Maps a full token sequence back to text.
///
/// Implementations must be deterministic given the whole sequence: the
/// streaming decoder re-decodes its buffer on every step.
pub trait Detokenizer {
    fn detokenize(&self, tokens: &[Token]) -> Result<String, EngineError>;
}

/// Per-step hook handed to [`InferenceBackend::generate`].
pub type StepCallback<'a> = dyn FnMut(&[Token]) -> Result<StreamStatus, EngineError> + 'a;

/// Backend-agnostic interface for inference engines.
pub trait InferenceBackend {
    /// Cheap handle used by the streaming decoder while the backend is busy
    /// generating.
    type Tokenizer: Detokenizer + Clone;

    fn load(model_path: &Path, settings: &BindingSettings) -> Result<Self, EngineError>
    where
        Self: Sized;

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, EngineError>;

    fn tokenizer(&self) -> Self::Tokenizer;

    /// Active context window in tokens.
    fn context_size(&self) -> usize;

    /// Runs the decode loop.
    ///
    /// `on_step` receives the prompt tokens first, then every sampled token
    /// one at a time. The loop ends on an end-of-generation token, after
    /// `max_new_tokens`, or as soon as `on_step` reports
    /// [`StreamStatus::Cancelled`]. Returns the generated tokens.
    fn generate(
        &mut self,
        prompt_tokens: &[Token],
        max_new_tokens: u32,
        params: &GenerationParams,
        on_step: &mut StepCallback<'_>,
    ) -> Result<Vec<Token>, EngineError>;
}

/// Sampling parameters for a single generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    /// -1 picks a fresh seed per call
    pub seed: i64,
    pub n_threads: i32,
    /// 0.0 disables locally typical sampling
    pub typical_p: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 50,
            top_p: 0.96,
            repeat_penalty: 1.3,
            seed: -1,
            n_threads: 8,
            typical_p: 0.0,
        }
    }
}

impl GenerationParams {
    /// Builds parameters from host-supplied overrides.
    ///
    /// Missing keys keep their defaults and unknown keys are ignored, so a
    /// host can pass its whole parameter map.
    pub fn from_overrides(overrides: &Value) -> Result<Self, EngineError> {
        if overrides.is_null() {
            return Ok(Self::default());
        }
        let mut params: GenerationParams = serde_json::from_value(overrides.clone())
            .map_err(|e| EngineError::Configuration(format!("Invalid generation parameters: {}", e)))?;
        params.validate();
        Ok(params)
    }

    /// Clamp values into ranges the samplers accept
    pub fn validate(&mut self) {
        self.temperature = self.temperature.max(0.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        self.typical_p = self.typical_p.clamp(0.0, 1.0);
        self.top_k = self.top_k.max(0);
        if self.n_threads < 1 {
            self.n_threads = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_params() {
        let params = GenerationParams::default();
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.top_k, 50);
        assert_eq!(params.top_p, 0.96);
        assert_eq!(params.typical_p, 0.0);
        assert_eq!(params.seed, -1);
    }

    #[test]
    fn test_overrides_keep_defaults() {
        let params =
            GenerationParams::from_overrides(&json!({"temperature": 0.1, "top_k": 5, "extra": true}))
                .unwrap();
        assert_eq!(params.temperature, 0.1);
        assert_eq!(params.top_k, 5);
        assert_eq!(params.top_p, 0.96);
        assert_eq!(params.n_threads, 8);
    }

    #[test]
    fn test_null_overrides() {
        let params = GenerationParams::from_overrides(&Value::Null).unwrap();
        assert_eq!(params, GenerationParams::default());
    }

    #[test]
    fn test_invalid_overrides() {
        let err = GenerationParams::from_overrides(&json!({"top_k": "many"})).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_validation_clamps() {
        let mut params = GenerationParams {
            temperature: -1.0,
            top_p: 3.0,
            typical_p: -0.5,
            top_k: -4,
            n_threads: 0,
            ..GenerationParams::default()
        };
        params.validate();
        assert_eq!(params.temperature, 0.0);
        assert_eq!(params.top_p, 1.0);
        assert_eq!(params.typical_p, 0.0);
        assert_eq!(params.top_k, 0);
        assert_eq!(params.n_threads, 1);
    }
}
