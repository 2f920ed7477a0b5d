//! Model files
//!
//! Resolves the selected model to a GGUF file and checks its header before
//! handing it to llama.cpp.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Magic bytes at the start of every GGUF file
pub const GGUF_MAGIC: &[u8; 4] = b"GGUF";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model not found: {0}")]
    NotFound(PathBuf),
    #[error("No GGUF file in {0}")]
    NoWeights(PathBuf),
    #[error("{0} is not a GGUF file")]
    InvalidMagic(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Check that `path` starts with the GGUF magic
pub fn validate_gguf(path: &Path) -> Result<(), ModelError> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    if file.read_exact(&mut magic).is_err() || &magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(path.to_path_buf()));
    }
    Ok(())
}

/// Resolve `model_name` under `models_dir` to a loadable weight file.
///
/// The name may point at a GGUF file or at a directory holding one (as left
/// behind by a repository download). For split models the first shard sorts
/// first and llama.cpp picks up the rest.
pub fn resolve_model_file(models_dir: &Path, model_name: &str) -> Result<PathBuf, ModelError> {
    let candidate = models_dir.join(model_name);

    if candidate.is_file() {
        validate_gguf(&candidate)?;
        return Ok(candidate);
    }

    if candidate.is_dir() {
        let mut weights: Vec<PathBuf> = fs::read_dir(&candidate)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"))
            })
            .collect();
        weights.sort();

        let file = weights
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::NoWeights(candidate.clone()))?;
        validate_gguf(&file)?;
        return Ok(file);
    }

    Err(ModelError::NotFound(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_gguf(path: &Path) {
        let mut bytes = GGUF_MAGIC.to_vec();
        bytes.extend_from_slice(&[3, 0, 0, 0]);
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_validate_gguf() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("model.gguf");
        write_gguf(&good);
        assert!(validate_gguf(&good).is_ok());

        let bad = dir.path().join("model.bin");
        fs::write(&bad, b"PK\x03\x04").unwrap();
        assert!(matches!(validate_gguf(&bad), Err(ModelError::InvalidMagic(_))));

        let short = dir.path().join("short.gguf");
        fs::write(&short, b"GG").unwrap();
        assert!(matches!(validate_gguf(&short), Err(ModelError::InvalidMagic(_))));
    }

    #[test]
    fn test_resolve_file() {
        let dir = tempfile::tempdir().unwrap();
        write_gguf(&dir.path().join("tiny.Q4_K_M.gguf"));

        let path = resolve_model_file(dir.path(), "tiny.Q4_K_M.gguf").unwrap();
        assert_eq!(path, dir.path().join("tiny.Q4_K_M.gguf"));
    }

    #[test]
    fn test_resolve_directory_picks_first_shard() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("Tiny-GGUF");
        fs::create_dir(&repo).unwrap();
        fs::write(repo.join("README.md"), "readme").unwrap();
        write_gguf(&repo.join("tiny-00002-of-00002.gguf"));
        write_gguf(&repo.join("tiny-00001-of-00002.gguf"));

        let path = resolve_model_file(dir.path(), "Tiny-GGUF").unwrap();
        assert_eq!(path, repo.join("tiny-00001-of-00002.gguf"));
    }

    #[test]
    fn test_resolve_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_model_file(dir.path(), "missing"),
            Err(ModelError::NotFound(_))
        ));

        fs::create_dir(dir.path().join("empty")).unwrap();
        assert!(matches!(
            resolve_model_file(dir.path(), "empty"),
            Err(ModelError::NoWeights(_))
        ));
    }
}
