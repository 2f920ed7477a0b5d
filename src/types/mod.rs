//! Shared type definitions
//!
//! This module contains the data types shared between the binding, the
//! inference layer and storage.

pub mod config;
pub mod message;
pub mod model;
pub mod token;

pub use config::InstallOption;
pub use message::MessageType;
pub use model::{LocalModel, ModelCard};
pub use token::Token;
