//! Message types
//!
//! Kinds of text the binding hands back to the host callback.

use serde::{Deserialize, Serialize};

/// Kind of a callback invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Incremental piece of generated text
    Chunk,
    /// The complete generated text, sent once at the end
    Full,
}

impl MessageType {
    pub fn is_chunk(self) -> bool {
        matches!(self, MessageType::Chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_kind() {
        assert!(MessageType::Chunk.is_chunk());
        assert!(!MessageType::Full.is_chunk());
    }

    #[test]
    fn test_message_type_serialization() {
        let json = serde_json::to_string(&MessageType::Full).unwrap();
        assert_eq!(json, "\"Full\"");
    }
}
