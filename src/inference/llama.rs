//! llama.cpp backend
//!
//! Loads quantized GGUF weights through `llama-cpp-2` and runs the
//! prefill/sample/decode loop for the binding.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};
use once_cell::sync::OnceCell;

use crate::inference::engine::{
    Detokenizer, EngineError, GenerationParams, InferenceBackend, StepCallback,
};
use crate::storage::settings::BindingSettings;
use crate::types::Token;

/// RoPE base used by llama-family models when the GGUF does not say
const DEFAULT_ROPE_FREQ_BASE: f32 = 10_000.0;

/// Smallest prefill batch we allocate
const MIN_BATCH: usize = 512;

static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

/// llama.cpp may only be initialised once per process.
fn llama_backend() -> Result<&'static LlamaBackend, EngineError> {
    BACKEND.get_or_try_init(|| {
        send_logs_to_tracing(LogOptions::default());
        LlamaBackend::init().map_err(|e| EngineError::Backend(e.to_string()))
    })
}

/// Linear position-embedding compression as a RoPE frequency scale
pub fn rope_freq_scale(compress_pos_emb: u32) -> f32 {
    1.0 / compress_pos_emb.max(1) as f32
}

/// NTK-aware RoPE base for a context extension factor `alpha` (head_dim 128).
pub fn ntk_rope_freq_base(base: f32, alpha: u32) -> f32 {
    base * (alpha.max(1) as f32).powf(64.0 / 63.0)
}

fn resolve_seed(seed: i64) -> u32 {
    if seed >= 0 {
        return u32::try_from(seed).unwrap_or_else(|_| {
            tracing::warn!("Seed {} does not fit in 32 bits, using {}", seed, u32::MAX);
            u32::MAX
        });
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ d.as_secs() as u32)
        .unwrap_or(1234)
}

/// Detokenizer handle sharing the loaded model
#[derive(Clone)]
pub struct LlamaTokenizer {
    model: Arc<LlamaModel>,
}

impl Detokenizer for LlamaTokenizer {
    fn detokenize(&self, tokens: &[Token]) -> Result<String, EngineError> {
        // Pieces may split a UTF-8 sequence, so join bytes before decoding.
        let mut bytes = Vec::with_capacity(tokens.len() * 4);
        for token in tokens {
            let piece = self
                .model
                .token_to_bytes(LlamaToken::new(token.0), Special::Plaintext)
                .map_err(|e| EngineError::Detokenize(e.to_string()))?;
            bytes.extend_from_slice(&piece);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// llama.cpp inference backend
pub struct LlamaCppBackend {
    model: Arc<LlamaModel>,
    ctx_size: u32,
    rope_freq_scale: f32,
    rope_freq_base: Option<f32>,
}

impl LlamaCppBackend {
    fn context_params(&self, params: &GenerationParams) -> Result<LlamaContextParams, EngineError> {
        let n_ctx = NonZeroU32::new(self.ctx_size)
            .ok_or_else(|| EngineError::Configuration("ctx_size must be greater than zero".into()))?;

        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(self.ctx_size)
            .with_n_threads(params.n_threads)
            .with_n_threads_batch(params.n_threads)
            .with_rope_freq_scale(self.rope_freq_scale);
        if let Some(base) = self.rope_freq_base {
            ctx_params = ctx_params.with_rope_freq_base(base);
        }
        Ok(ctx_params)
    }

    fn model_rope_base(model: &LlamaModel) -> f32 {
        let arch = model
            .meta_val_str("general.architecture")
            .unwrap_or_else(|_| "llama".to_string());
        model
            .meta_val_str(&format!("{}.rope.freq_base", arch))
            .ok()
            .and_then(|v| v.trim().parse::<f32>().ok())
            .unwrap_or(DEFAULT_ROPE_FREQ_BASE)
    }
}

/// One link of the sampler chain
#[derive(Debug, Clone, Copy, PartialEq)]
enum SamplerStage {
    Greedy,
    TopK(i32),
    Typical(f32),
    TopP(f32),
    Temperature(f32),
    Dist(u32),
}

/// Truncating filters first, then temperature, then the seeded draw
fn sampler_stages(params: &GenerationParams) -> Vec<SamplerStage> {
    if params.temperature <= 0.0 {
        return vec![SamplerStage::Greedy];
    }

    let mut stages = Vec::new();
    if params.top_k > 0 {
        stages.push(SamplerStage::TopK(params.top_k));
    }
    if params.typical_p > 0.0 && params.typical_p < 1.0 {
        stages.push(SamplerStage::Typical(params.typical_p));
    }
    if params.top_p < 1.0 {
        stages.push(SamplerStage::TopP(params.top_p));
    }
    stages.push(SamplerStage::Temperature(params.temperature));
    stages.push(SamplerStage::Dist(resolve_seed(params.seed)));
    stages
}

fn build_sampler(params: &GenerationParams) -> LlamaSampler {
    let samplers = sampler_stages(params).into_iter().map(|stage| match stage {
        SamplerStage::Greedy => LlamaSampler::greedy(),
        SamplerStage::TopK(k) => LlamaSampler::top_k(k),
        SamplerStage::Typical(p) => LlamaSampler::typical(p, 1),
        SamplerStage::TopP(p) => LlamaSampler::top_p(p, 1),
        SamplerStage::Temperature(t) => LlamaSampler::temp(t),
        SamplerStage::Dist(seed) => LlamaSampler::dist(seed),
    });

    LlamaSampler::chain_simple(samplers)
}

impl InferenceBackend for LlamaCppBackend {
    type Tokenizer = LlamaTokenizer;

    fn load(model_path: &Path, settings: &BindingSettings) -> Result<Self, EngineError> {
        let backend = llama_backend()?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(settings.gpu_layers);
        tracing::info!(
            "Loading model {:?} (ctx_size={}, gpu_layers={})",
            model_path,
            settings.ctx_size,
            settings.gpu_layers
        );
        let model = LlamaModel::load_from_file(backend, model_path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        let rope_freq_base = if settings.alpha > 1 {
            let base = ntk_rope_freq_base(Self::model_rope_base(&model), settings.alpha);
            tracing::debug!("NTK alpha {} -> rope_freq_base {}", settings.alpha, base);
            Some(base)
        } else {
            None
        };

        let n_ctx_train = model.n_ctx_train();
        if settings.ctx_size > n_ctx_train && settings.compress_pos_emb == 1 && settings.alpha == 1 {
            tracing::warn!(
                "ctx_size {} exceeds the trained context {} without RoPE scaling; expect degraded output",
                settings.ctx_size,
                n_ctx_train
            );
        }

        Ok(Self {
            model: Arc::new(model),
            ctx_size: settings.ctx_size,
            rope_freq_scale: rope_freq_scale(settings.compress_pos_emb),
            rope_freq_base,
        })
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, EngineError> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| EngineError::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| Token(t.0)).collect())
    }

    fn tokenizer(&self) -> LlamaTokenizer {
        LlamaTokenizer {
            model: Arc::clone(&self.model),
        }
    }

    fn context_size(&self) -> usize {
        self.ctx_size as usize
    }

    fn generate(
        &mut self,
        prompt_tokens: &[Token],
        max_new_tokens: u32,
        params: &GenerationParams,
        on_step: &mut StepCallback<'_>,
    ) -> Result<Vec<Token>, EngineError> {
        if prompt_tokens.is_empty() {
            return Err(EngineError::Tokenize(
                "Prompt tokenization resulted in an empty sequence".into(),
            ));
        }

        let requested = prompt_tokens.len() + max_new_tokens as usize;
        if requested > self.context_size() {
            return Err(EngineError::ContextOverflow {
                requested,
                available: self.context_size(),
            });
        }

        let backend = llama_backend()?;
        let mut ctx = self
            .model
            .new_context(backend, self.context_params(params)?)
            .map_err(|e| EngineError::Backend(e.to_string()))?;

        let mut batch = LlamaBatch::new(prompt_tokens.len().max(MIN_BATCH), 1);
        let last_index = prompt_tokens.len() - 1;
        for (i, token) in prompt_tokens.iter().enumerate() {
            batch
                .add(LlamaToken::new(token.0), i as i32, &[0], i == last_index)
                .map_err(|e| EngineError::Backend(e.to_string()))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Backend(format!("Prefill failed: {}", e)))?;

        let mut generated = Vec::new();
        if on_step(prompt_tokens)?.is_cancelled() {
            return Ok(generated);
        }

        let mut sampler = build_sampler(params);
        let mut n_cur = batch.n_tokens();
        while generated.len() < max_new_tokens as usize {
            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            if self.model.is_eog_token(token) {
                tracing::debug!("End of generation after {} tokens", generated.len());
                break;
            }
            sampler.accept(token);

            let token_id = Token(token.0);
            generated.push(token_id);
            if on_step(&[token_id])?.is_cancelled() {
                tracing::info!("Generation cancelled after {} tokens", generated.len());
                break;
            }

            batch.clear();
            batch
                .add(token, n_cur, &[0], true)
                .map_err(|e| EngineError::Backend(e.to_string()))?;
            n_cur += 1;
            ctx.decode(&mut batch)
                .map_err(|e| EngineError::Backend(format!("Decode failed at position {}: {}", n_cur, e)))?;
        }

        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rope_freq_scale() {
        assert_eq!(rope_freq_scale(1), 1.0);
        assert_eq!(rope_freq_scale(4), 0.25);
        assert_eq!(rope_freq_scale(0), 1.0);
    }

    #[test]
    fn test_ntk_rope_base() {
        assert_eq!(ntk_rope_freq_base(10_000.0, 1), 10_000.0);
        let scaled = ntk_rope_freq_base(10_000.0, 2);
        assert!(scaled > 20_000.0 && scaled < 20_300.0);
    }

    #[test]
    fn test_explicit_seed_is_kept() {
        assert_eq!(resolve_seed(42), 42);
        assert_eq!(resolve_seed(u32::MAX as i64), u32::MAX);
    }

    #[test]
    fn test_oversized_seed_is_clamped() {
        assert_eq!(resolve_seed(u32::MAX as i64 + 5), u32::MAX);
        assert_eq!(resolve_seed(i64::MAX), u32::MAX);
    }

    #[test]
    fn test_sampler_order() {
        let params = GenerationParams {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            typical_p: 0.5,
            seed: 7,
            ..GenerationParams::default()
        };
        assert_eq!(
            sampler_stages(&params),
            vec![
                SamplerStage::TopK(40),
                SamplerStage::Typical(0.5),
                SamplerStage::TopP(0.9),
                SamplerStage::Temperature(0.7),
                SamplerStage::Dist(7),
            ]
        );
    }

    #[test]
    fn test_sampler_skips_disabled_filters() {
        let params = GenerationParams {
            top_k: 0,
            top_p: 1.0,
            typical_p: 0.0,
            seed: 3,
            ..GenerationParams::default()
        };
        assert_eq!(
            sampler_stages(&params),
            vec![SamplerStage::Temperature(0.7), SamplerStage::Dist(3)]
        );

        let greedy = GenerationParams {
            temperature: 0.0,
            ..GenerationParams::default()
        };
        assert_eq!(sampler_stages(&greedy), vec![SamplerStage::Greedy]);
    }
}
