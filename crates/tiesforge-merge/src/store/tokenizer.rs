//! Tokenizer artifacts.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::PersistenceError;

/// Files that make up a HuggingFace tokenizer. Whatever subset exists is
/// copied.
pub const TOKENIZER_FILES: &[&str] = &[
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "tokenizer.model",
    "vocab.json",
    "merges.txt",
    "added_tokens.json",
];

/// A tokenizer located on disk, ready to be copied next to merged weights.
#[derive(Debug, Clone)]
pub struct TokenizerFiles {
    /// Identifier the tokenizer was loaded from.
    pub source: String,
    /// File name and current location of each artifact.
    pub files: Vec<(String, PathBuf)>,
    /// Vocabulary size (including added tokens), when `tokenizer.json` exists.
    pub vocab_size: Option<usize>,
}

impl TokenizerFiles {
    /// Collect tokenizer files from a model directory. A path to a file inside
    /// the directory is accepted too.
    pub fn from_dir(source: &str, dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref();
        let dir = if dir.is_file() {
            dir.parent().unwrap_or(dir)
        } else {
            dir
        };

        let files = TOKENIZER_FILES
            .iter()
            .map(|name| (name.to_string(), dir.join(name)))
            .filter(|(_, path)| path.is_file())
            .collect();

        Self::from_files(source, files)
    }

    /// Build from already located files, checking that `tokenizer.json` (when
    /// present) actually loads.
    pub fn from_files(
        source: &str,
        files: Vec<(String, PathBuf)>,
    ) -> Result<Self, PersistenceError> {
        if files.is_empty() {
            return Err(PersistenceError::Tokenizer(format!(
                "no tokenizer files found for {}",
                source
            )));
        }

        let vocab_size = match files.iter().find(|(name, _)| name == "tokenizer.json") {
            Some((_, path)) => {
                let tokenizer = tokenizers::Tokenizer::from_file(path)
                    .map_err(|e| PersistenceError::Tokenizer(format!("{:?}: {}", path, e)))?;
                Some(tokenizer.get_vocab_size(true))
            }
            None => None,
        };

        debug!(
            "Tokenizer from {}: {} files, vocab size {:?}",
            source,
            files.len(),
            vocab_size
        );

        Ok(Self {
            source: source.to_string(),
            files,
            vocab_size,
        })
    }

    /// Copy all files into `dir`. Returns the written paths.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, PersistenceError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let mut written = Vec::with_capacity(self.files.len());
        for (name, src) in &self.files {
            let dst = dir.join(name);
            if !same_file(src, &dst) {
                std::fs::copy(src, &dst)?;
            }
            written.push(dst);
        }

        info!("Saved tokenizer from {} to {:?}", self.source, dir);
        Ok(written)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
