//! The model-loading boundary.
//!
//! Parsing model containers is not this crate's job: the engine consumes a
//! [`ModelLoader`] implementation that yields a validated bundle plus its
//! tokenizer. What lives here is the contract, the load-time error
//! taxonomy, and the content-hash fingerprint used to deduplicate imports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::ModelBundle;
use crate::tokenizer::Tokenizer;

#[derive(Error, Debug)]
pub enum LoadError {
    /// The file could not be read or parsed.
    #[error("failed to load model from {path}: {message}")]
    ModelLoadFailed { path: PathBuf, message: String },
    /// The container or weight scheme is not one the engine supports.
    #[error("unsupported model format: {0}")]
    UnsupportedModelFormat(String),
    /// The tokenizer does not agree with the model's vocabulary.
    #[error("tokenizer mismatch: {0}")]
    TokenizerMismatch(String),
    /// The file parsed but an internal consistency check failed.
    #[error("model invariant broken: {0}")]
    InvariantBroken(String),
}

/// A loaded model: the immutable bundle plus the tokenizer built from the
/// same file, both shareable across sessions.
pub struct LoadedModel {
    pub bundle: Arc<ModelBundle>,
    pub tokenizer: Arc<dyn Tokenizer>,
}

impl Clone for LoadedModel {
    fn clone(&self) -> Self {
        LoadedModel {
            bundle: Arc::clone(&self.bundle),
            tokenizer: Arc::clone(&self.tokenizer),
        }
    }
}

/// Options the engine forwards to the loader.
#[derive(Debug, Clone, Default)]
pub struct LoadContext {
    /// Whether importing foreign GGUF files is permitted at all.
    pub allow_gguf_import: bool,
    /// Where converted imports may be cached on disk.
    pub cache_dir: Option<PathBuf>,
    /// Cap the model's context window below what the file declares.
    pub max_context_tokens: Option<usize>,
}

/// Produces model bundles from files. The GGUF parser in the companion
/// tooling implements this; tests use synthetic loaders.
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path, ctx: &LoadContext) -> Result<LoadedModel, LoadError>;
}

/// Cross-check a tokenizer against the bundle it was loaded with. Loaders
/// call this before returning; the engine calls it again defensively.
pub fn check_tokenizer(bundle: &ModelBundle, tokenizer: &dyn Tokenizer) -> Result<(), LoadError> {
    let hp = &bundle.hyperparameters;
    if tokenizer.vocab_size() > hp.n_vocab {
        return Err(LoadError::TokenizerMismatch(format!(
            "tokenizer vocabulary of {} exceeds model vocabulary of {}",
            tokenizer.vocab_size(),
            hp.n_vocab
        )));
    }
    if let Some(eos) = tokenizer.eos_id() {
        if eos != hp.eos_token_id {
            return Err(LoadError::TokenizerMismatch(format!(
                "tokenizer eos {} disagrees with model eos {}",
                eos, hp.eos_token_id
            )));
        }
    }
    if let (Some(t_bos), Some(m_bos)) = (tokenizer.bos_id(), hp.bos_token_id) {
        if t_bos != m_bos {
            return Err(LoadError::TokenizerMismatch(format!(
                "tokenizer bos {t_bos} disagrees with model bos {m_bos}"
            )));
        }
    }
    Ok(())
}

/// A model file fingerprint: the SHA-256 of its contents.
///
/// Import caching keys on this rather than the path, so identical bytes
/// under two names load once and an edited file under the same name is a
/// miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelFingerprint([u8; 32]);

impl ModelFingerprint {
    pub fn of_file(path: &Path) -> Result<Self, LoadError> {
        let mut file = std::fs::File::open(path).map_err(|e| LoadError::ModelLoadFailed {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).map_err(|e| LoadError::ModelLoadFailed {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        Ok(ModelFingerprint(hasher.finalize().into()))
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        ModelFingerprint(Sha256::digest(bytes).into())
    }

    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::ByteTokenizer;

    #[test]
    fn fingerprint_is_content_keyed() {
        let a = ModelFingerprint::of_bytes(b"weights-v1");
        let b = ModelFingerprint::of_bytes(b"weights-v1");
        let c = ModelFingerprint::of_bytes(b"weights-v2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn fingerprint_of_file_round_trips() {
        let dir = std::env::temp_dir();
        let p1 = dir.join("emberlm-fp-one.bin");
        let p2 = dir.join("emberlm-fp-two.bin");
        std::fs::write(&p1, b"same bytes").unwrap();
        std::fs::write(&p2, b"same bytes").unwrap();
        // Same contents under two paths: one fingerprint.
        assert_eq!(
            ModelFingerprint::of_file(&p1).unwrap(),
            ModelFingerprint::of_file(&p2).unwrap()
        );
        std::fs::remove_file(&p1).ok();
        std::fs::remove_file(&p2).ok();
    }

    #[test]
    fn tokenizer_mismatch_is_detected() {
        let model = crate::test_support::tiny_model(0x11);
        // The synthetic model's eos agrees with ByteTokenizer's.
        assert!(check_tokenizer(&model, &ByteTokenizer::new()).is_ok());

        let mut wrong = crate::test_support::tiny_model(0x12);
        wrong.hyperparameters.eos_token_id = 9;
        let err = check_tokenizer(&wrong, &ByteTokenizer::new()).unwrap_err();
        assert!(matches!(err, LoadError::TokenizerMismatch(_)));
    }
}
