//! quant-binding
//!
//! Host binding for quantized GGUF language models: streamed generation
//! through llama.cpp, model downloads from the HuggingFace hub and the
//! binding's on-disk configuration.

pub mod binding;
pub mod inference;
pub mod storage;
pub mod system;
pub mod types;

pub use binding::Binding;

/// Install a `tracing` subscriber honouring `RUST_LOG` (default `info`).
///
/// Does nothing if the host already installed one.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
