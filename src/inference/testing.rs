//! Test doubles for the inference seam

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::inference::engine::{
    Detokenizer, EngineError, GenerationParams, InferenceBackend, StepCallback,
};
use crate::storage::settings::BindingSettings;
use crate::types::Token;

/// Detokenizer backed by a fixed vocabulary; token `i` decodes to `vocab[i]`.
#[derive(Debug, Clone)]
pub struct VocabTokenizer {
    vocab: Arc<Vec<String>>,
}

impl VocabTokenizer {
    pub fn new(pieces: &[&str]) -> Self {
        Self {
            vocab: Arc::new(pieces.iter().map(|p| p.to_string()).collect()),
        }
    }
}

impl Detokenizer for VocabTokenizer {
    fn detokenize(&self, tokens: &[Token]) -> Result<String, EngineError> {
        let mut text = String::new();
        for token in tokens {
            let piece = usize::try_from(token.0)
                .ok()
                .and_then(|idx| self.vocab.get(idx))
                .ok_or_else(|| EngineError::Detokenize(format!("unknown token {}", token.0)))?;
            text.push_str(piece);
        }
        Ok(text)
    }
}

/// Backend that replays a fixed token script instead of sampling.
pub struct ScriptedBackend {
    tokenizer: VocabTokenizer,
    script: Vec<Token>,
    pub steps_seen: usize,
    pub last_params: Option<GenerationParams>,
    pub loaded_from: Option<PathBuf>,
}

impl ScriptedBackend {
    /// Token 0 of `pieces` is used for every prompt token.
    pub fn new(pieces: &[&str], script: &[i32]) -> Self {
        Self {
            tokenizer: VocabTokenizer::new(pieces),
            script: script.iter().copied().map(Token).collect(),
            steps_seen: 0,
            last_params: None,
            loaded_from: None,
        }
    }
}

impl InferenceBackend for ScriptedBackend {
    type Tokenizer = VocabTokenizer;

    fn load(model_path: &Path, _settings: &BindingSettings) -> Result<Self, EngineError> {
        let mut backend = Self::new(&["<prompt>"], &[]);
        backend.loaded_from = Some(model_path.to_path_buf());
        Ok(backend)
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, EngineError> {
        Ok(text.split_whitespace().map(|_| Token(0)).collect())
    }

    fn tokenizer(&self) -> VocabTokenizer {
        self.tokenizer.clone()
    }

    fn context_size(&self) -> usize {
        4096
    }

    fn generate(
        &mut self,
        prompt_tokens: &[Token],
        max_new_tokens: u32,
        params: &GenerationParams,
        on_step: &mut StepCallback<'_>,
    ) -> Result<Vec<Token>, EngineError> {
        self.last_params = Some(params.clone());
        let mut generated = Vec::new();
        if on_step(prompt_tokens)?.is_cancelled() {
            return Ok(generated);
        }
        for token in self.script.iter().take(max_new_tokens as usize) {
            generated.push(*token);
            self.steps_seen += 1;
            if on_step(&[*token])?.is_cancelled() {
                break;
            }
        }
        Ok(generated)
    }
}
