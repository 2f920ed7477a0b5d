//! System utilities
//!
//! Hardware probing used when installing the binding.

pub mod gpu;

pub use gpu::{detect_gpu, GpuBackend, GpuInfo};
