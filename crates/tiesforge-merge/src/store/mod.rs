//! Persistence of merged models.
//!
//! A [`ModelStore`] turns the engine's output into a HuggingFace-style model
//! directory: sharded safetensors weights, `config.json` and the tokenizer of
//! the first fine-tuned checkpoint.

mod tokenizer;
mod writer;

pub use tokenizer::{TokenizerFiles, TOKENIZER_FILES};
pub use writer::{ShardedWriter, INDEX_FILE_NAME};

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::engine::MergedModel;
use crate::source::{hub_api, hub_repo};
use crate::{Dtype, ModelSource, PersistenceError};

/// Default maximum shard size (2 GB).
pub const DEFAULT_MAX_SHARD_SIZE: u64 = 2_000_000_000;

/// Writes merged weights and tokenizers.
pub trait ModelStore: Send {
    /// Save `model` into `output` as shards of at most `max_shard_size` bytes,
    /// with float tensors stored as `dtype`. Returns the shard paths.
    fn save_model(
        &self,
        model: &dyn MergedModel,
        output: &Path,
        max_shard_size: u64,
        dtype: Dtype,
    ) -> Result<Vec<PathBuf>, PersistenceError>;

    /// Locate the tokenizer of the model identified by `source`.
    fn load_tokenizer(&self, source: &str) -> Result<TokenizerFiles, PersistenceError>;

    /// Copy `tokenizer` into `output`. Returns the written paths.
    fn save_tokenizer(
        &self,
        tokenizer: &TokenizerFiles,
        output: &Path,
    ) -> Result<Vec<PathBuf>, PersistenceError>;
}

/// Store for local directories and HuggingFace Hub repositories.
#[derive(Debug, Clone, Default)]
pub struct HfModelStore {
    offline: bool,
}

impl HfModelStore {
    /// Create a store that may download tokenizers from the Hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that only reads local directories.
    pub fn offline() -> Self {
        Self { offline: true }
    }

    fn load_hub_tokenizer(
        &self,
        source: &str,
        repo_id: &str,
        revision: Option<&str>,
    ) -> Result<TokenizerFiles, PersistenceError> {
        if self.offline {
            return Err(PersistenceError::Tokenizer(format!(
                "{} is not a local directory and Hub access is disabled",
                source
            )));
        }

        info!("Downloading tokenizer from {}", repo_id);
        let api = hub_api()?;
        let repo = api.repo(hub_repo(repo_id, revision));
        let siblings = repo.info()?.siblings;

        let mut files = Vec::new();
        for name in TOKENIZER_FILES {
            if siblings.iter().any(|s| s.rfilename == *name) {
                files.push((name.to_string(), repo.get(name)?));
            }
        }

        TokenizerFiles::from_files(source, files)
    }
}

impl ModelStore for HfModelStore {
    fn save_model(
        &self,
        model: &dyn MergedModel,
        output: &Path,
        max_shard_size: u64,
        dtype: Dtype,
    ) -> Result<Vec<PathBuf>, PersistenceError> {
        let mut writer = ShardedWriter::new(output, max_shard_size)?;
        let target = dtype.to_safetensors();

        for name in model.tensor_names() {
            let tensor = model.load_tensor(&name)?.into_dtype(target);
            writer.write_tensor(&name, tensor)?;
        }
        let shards = writer.finalize()?;

        match model.model_config() {
            Some(config) => {
                let mut config = config.clone();
                if let Some(obj) = config.as_object_mut() {
                    obj.insert(
                        "torch_dtype".to_string(),
                        serde_json::Value::String(dtype.as_str().to_string()),
                    );
                }
                std::fs::write(
                    output.join("config.json"),
                    serde_json::to_string_pretty(&config)?,
                )?;
            }
            None => warn!("Merged model has no config.json; writing weights only"),
        }

        Ok(shards)
    }

    fn load_tokenizer(&self, source: &str) -> Result<TokenizerFiles, PersistenceError> {
        match ModelSource::parse(source) {
            ModelSource::Local(path) => TokenizerFiles::from_dir(source, path),
            ModelSource::Hub { repo_id, revision } => {
                self.load_hub_tokenizer(source, &repo_id, revision.as_deref())
            }
        }
    }

    fn save_tokenizer(
        &self,
        tokenizer: &TokenizerFiles,
        output: &Path,
    ) -> Result<Vec<PathBuf>, PersistenceError> {
        tokenizer.save(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryModel;
    use crate::{SafetensorsModel, TensorBuf};

    #[test]
    fn test_save_model_converts_dtype_and_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = InMemoryModel::new()
            .with_tensor("embed.weight", TensorBuf::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]))
            .with_config(serde_json::json!({"model_type": "llama", "torch_dtype": "float32"}));

        let store = HfModelStore::offline();
        let shards = store
            .save_model(&model, temp_dir.path(), DEFAULT_MAX_SHARD_SIZE, Dtype::Bfloat16)
            .unwrap();
        assert_eq!(shards.len(), 1);

        let saved = SafetensorsModel::open(temp_dir.path()).unwrap();
        let tensor = saved.load_tensor("embed.weight").unwrap();
        assert_eq!(tensor.dtype, safetensors::Dtype::BF16);
        assert_eq!(tensor.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(saved.model_config().unwrap()["torch_dtype"], "bfloat16");
        assert_eq!(saved.model_config().unwrap()["model_type"], "llama");
    }

    /// Lists a tensor it cannot load.
    struct TruncatedModel(InMemoryModel);

    impl MergedModel for TruncatedModel {
        fn tensor_names(&self) -> Vec<String> {
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        }

        fn load_tensor(&self, name: &str) -> Result<TensorBuf, PersistenceError> {
            self.0.load_tensor(name)
        }
    }

    #[test]
    fn test_failed_save_removes_partial_shards() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = TruncatedModel(
            InMemoryModel::new()
                .with_tensor("a", TensorBuf::from_f32(vec![4], &[1.0; 4]))
                .with_tensor("b", TensorBuf::from_f32(vec![4], &[2.0; 4])),
        );

        let err = HfModelStore::offline()
            .save_model(&model, temp_dir.path(), 8, Dtype::Float32)
            .unwrap_err();
        assert!(matches!(err, PersistenceError::TensorNotFound(name) if name == "c"));

        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(leftovers.is_empty(), "unexpected files: {:?}", leftovers);
    }

    #[test]
    fn test_load_local_tokenizer() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            temp_dir.path().join("tokenizer.json"),
            tokenizer::tests::WORD_LEVEL_TOKENIZER,
        )
        .unwrap();

        let source = temp_dir.path().to_str().unwrap();
        let tokenizer = HfModelStore::offline().load_tokenizer(source).unwrap();
        assert_eq!(tokenizer.source, source);
        assert_eq!(tokenizer.vocab_size, Some(3));
    }

    #[test]
    fn test_offline_store_rejects_hub_tokenizer() {
        let err = HfModelStore::offline()
            .load_tokenizer("meta-llama/Llama-2-7b")
            .unwrap_err();
        assert!(err.to_string().contains("Hub access is disabled"));
    }
}
