//! Model catalog
//!
//! Models this binding knows how to fetch. A `models.json` in the configs
//! directory replaces the catalog shipped with the crate.

use std::fs;
use std::path::Path;

use crate::storage::StorageError;
use crate::types::ModelCard;

const BUILTIN_CATALOG: &str = include_str!("../../assets/models.json");

/// Catalog shipped with the binding
pub fn builtin_catalog() -> Result<Vec<ModelCard>, StorageError> {
    Ok(serde_json::from_str(BUILTIN_CATALOG)?)
}

/// Load the catalog at `path`, falling back to the built-in one when absent
pub fn load_catalog(path: &Path) -> Result<Vec<ModelCard>, StorageError> {
    if !path.exists() {
        return builtin_catalog();
    }
    let json = fs::read_to_string(path)?;
    let cards: Vec<ModelCard> = serde_json::from_str(&json)?;
    tracing::debug!("Loaded {} catalog entries from {:?}", cards.len(), path);
    Ok(cards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_parses() {
        let cards = builtin_catalog().unwrap();
        assert!(!cards.is_empty());
        for card in &cards {
            assert!(card.server.starts_with("https://huggingface.co/"));
            assert!(card.filename.ends_with(".gguf"));
        }
    }

    #[test]
    fn test_catalog_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        assert_eq!(load_catalog(&path).unwrap(), builtin_catalog().unwrap());

        fs::write(
            &path,
            r#"[{"name": "Tiny", "server": "https://huggingface.co/me/tiny", "filename": "tiny.gguf"}]"#,
        )
        .unwrap();
        let cards = load_catalog(&path).unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].name, "Tiny");
        assert!(cards[0].sha256.is_none());
    }

    #[test]
    fn test_corrupt_catalog_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        fs::write(&path, "[{").unwrap();
        assert!(matches!(load_catalog(&path), Err(StorageError::Json(_))));
    }
}
