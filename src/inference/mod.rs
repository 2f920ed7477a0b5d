//! LLM inference
//!
//! This module handles the backend seam, llama-cpp model loading and the
//! streaming detokenizer that turns generated tokens into printable text.

pub mod engine;
pub mod llama;
pub mod model;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use engine::{Detokenizer, EngineError, GenerationParams, InferenceBackend};
pub use llama::{LlamaCppBackend, LlamaTokenizer};
pub use model::{resolve_model_file, validate_gguf, ModelError, GGUF_MAGIC};
pub use streaming::{is_cjk_char, StreamDecoder, StreamError, StreamStatus};
