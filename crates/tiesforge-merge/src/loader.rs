//! Memory-mapped safetensors model directories.
//!
//! Merge engines that write their result to disk hand it back as a
//! [`SafetensorsModel`]. Files are memory-mapped and indexed once; tensors
//! are copied out one at a time so the store can reshard them without ever
//! holding the whole model in memory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::engine::MergedModel;
use crate::{PersistenceError, TensorBuf};

/// Location of a tensor within a memory-mapped file.
#[derive(Debug, Clone)]
struct TensorLocation {
    /// Index into mmaps array.
    file_idx: usize,
    /// Byte offset within the file.
    offset: usize,
    /// Length in bytes.
    len: usize,
    /// Data type.
    dtype: safetensors::Dtype,
    /// Shape.
    shape: Vec<usize>,
}

/// A model directory (or single file) of safetensors shards.
#[derive(Debug)]
pub struct SafetensorsModel {
    /// Path to the model directory.
    path: PathBuf,
    /// Memory-mapped files.
    mmaps: Vec<(PathBuf, memmap2::Mmap)>,
    /// Mapping from tensor name to its location.
    tensor_info: BTreeMap<String, TensorLocation>,
    /// Parsed `config.json`, when present.
    config: Option<serde_json::Value>,
}

impl SafetensorsModel {
    /// Open a model directory or a single `.safetensors` file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();

        let mut safetensor_files = Vec::new();
        if path.is_file() && path.extension().is_some_and(|e| e == "safetensors") {
            safetensor_files.push(path.clone());
        } else if path.is_dir() {
            for entry in std::fs::read_dir(&path)? {
                let file_path = entry?.path();
                if file_path.extension().is_some_and(|e| e == "safetensors") {
                    safetensor_files.push(file_path);
                }
            }
        }

        if safetensor_files.is_empty() {
            return Err(PersistenceError::MissingWeights(path));
        }

        // Sort for deterministic ordering
        safetensor_files.sort();

        info!(
            "Memory-mapping {} safetensors files from {:?}",
            safetensor_files.len(),
            path
        );

        let mut mmaps = Vec::with_capacity(safetensor_files.len());
        let mut tensor_info = BTreeMap::new();

        for (idx, file_path) in safetensor_files.into_iter().enumerate() {
            debug!("Memory-mapping {:?}", file_path);

            let file = std::fs::File::open(&file_path)?;
            // SAFETY: The file is opened read-only and the mapping lives as long
            // as this model. Nothing else in the process writes to it.
            #[allow(unsafe_code)]
            let mmap = unsafe { memmap2::Mmap::map(&file)? };

            let tensors = SafeTensors::deserialize(&mmap)?;
            let base_ptr = mmap.as_ptr() as usize;
            for name in tensors.names() {
                let tensor = tensors.tensor(name)?;
                let data = tensor.data();
                tensor_info.insert(
                    name.to_string(),
                    TensorLocation {
                        file_idx: idx,
                        offset: data.as_ptr() as usize - base_ptr,
                        len: data.len(),
                        dtype: tensor.dtype(),
                        shape: tensor.shape().to_vec(),
                    },
                );
            }

            mmaps.push((file_path, mmap));
        }

        let config_dir = if path.is_dir() {
            Some(path.as_path())
        } else {
            path.parent()
        };
        let config = match config_dir.map(|dir| dir.join("config.json")) {
            Some(config_path) if config_path.is_file() => {
                let content = std::fs::read_to_string(&config_path)?;
                Some(serde_json::from_str(&content)?)
            }
            _ => None,
        };

        info!("Indexed {} tensors", tensor_info.len());

        Ok(Self {
            path,
            mmaps,
            tensor_info,
            config,
        })
    }

    /// Get the model path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of indexed tensors.
    pub fn len(&self) -> usize {
        self.tensor_info.len()
    }

    /// Whether the model has no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensor_info.is_empty()
    }
}

impl MergedModel for SafetensorsModel {
    fn tensor_names(&self) -> Vec<String> {
        self.tensor_info.keys().cloned().collect()
    }

    fn load_tensor(&self, name: &str) -> Result<TensorBuf, PersistenceError> {
        let loc = self
            .tensor_info
            .get(name)
            .ok_or_else(|| PersistenceError::TensorNotFound(name.to_string()))?;

        let (_, mmap) = &self.mmaps[loc.file_idx];
        let data = mmap[loc.offset..loc.offset + loc.len].to_vec();
        Ok(TensorBuf::new(loc.dtype, loc.shape.clone(), data))
    }

    fn model_config(&self) -> Option<&serde_json::Value> {
        self.config.as_ref()
    }
}
