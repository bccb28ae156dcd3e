//! Sharded safetensors writer.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::{PersistenceError, TensorBuf};

/// Name of the weight index written next to multi-shard checkpoints.
pub const INDEX_FILE_NAME: &str = "model.safetensors.index.json";

const SINGLE_SHARD_NAME: &str = "model.safetensors";
const PART_SUFFIX: &str = ".part";

/// Writes tensors into size-capped safetensors shards.
///
/// Shards are written under temporary names while the total count is unknown
/// and renamed by [`finalize`](Self::finalize):
///
/// - one shard: `model.safetensors`
/// - several: `model-00001-of-00003.safetensors`, ... plus
///   `model.safetensors.index.json`
pub struct ShardedWriter {
    /// Output directory.
    output_path: PathBuf,
    /// Accumulated tensors for current shard.
    current_shard: Vec<(String, TensorBuf)>,
    /// Current shard size in bytes.
    current_size: u64,
    /// Maximum shard size in bytes.
    max_shard_size: u64,
    /// Temporary shard files and the tensors each one holds.
    written: Vec<(PathBuf, Vec<String>)>,
    /// Sum of all tensor payloads.
    total_size: u64,
}

#[derive(Serialize)]
struct IndexMetadata {
    total_size: u64,
}

#[derive(Serialize)]
struct WeightIndex {
    metadata: IndexMetadata,
    weight_map: BTreeMap<String, String>,
}

impl ShardedWriter {
    /// Create a writer for `output_path`, creating the directory if needed.
    pub fn new(output_path: impl AsRef<Path>, max_shard_size: u64) -> Result<Self, PersistenceError> {
        let output_path = output_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_path)?;
        remove_stale_parts(&output_path)?;

        Ok(Self {
            output_path,
            current_shard: Vec::new(),
            current_size: 0,
            max_shard_size: max_shard_size.max(1),
            written: Vec::new(),
            total_size: 0,
        })
    }

    /// Write a tensor. A tensor larger than the shard limit gets a shard of
    /// its own.
    pub fn write_tensor(&mut self, name: &str, tensor: TensorBuf) -> Result<(), PersistenceError> {
        let size = tensor.byte_len() as u64;

        // Check if we need to flush current shard
        if self.current_size + size > self.max_shard_size && !self.current_shard.is_empty() {
            self.flush_shard()?;
        }

        self.current_shard.push((name.to_string(), tensor));
        self.current_size += size;
        self.total_size += size;

        Ok(())
    }

    /// Flush current shard to disk.
    fn flush_shard(&mut self) -> Result<(), PersistenceError> {
        if self.current_shard.is_empty() {
            return Ok(());
        }

        let part_path = self.output_path.join(format!(
            "model-{:05}.safetensors{}",
            self.written.len() + 1,
            PART_SUFFIX
        ));
        debug!(
            "Writing {} tensors ({} bytes) to {:?}",
            self.current_shard.len(),
            self.current_size,
            part_path
        );

        let views = self
            .current_shard
            .iter()
            .map(|(name, t)| {
                safetensors::tensor::TensorView::new(t.dtype, t.shape.clone(), &t.data)
                    .map(|view| (name.as_str(), view))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let metadata = HashMap::from([("format".to_string(), "pt".to_string())]);
        safetensors::serialize_to_file(views, &Some(metadata), &part_path)?;

        let names = self.current_shard.drain(..).map(|(name, _)| name).collect();
        self.written.push((part_path, names));
        self.current_size = 0;

        Ok(())
    }

    /// Write any remaining tensors, give shards their final names and write
    /// the index. Returns the shard paths in order.
    pub fn finalize(mut self) -> Result<Vec<PathBuf>, PersistenceError> {
        self.flush_shard()?;

        if self.written.is_empty() {
            return Err(PersistenceError::MissingWeights(self.output_path.clone()));
        }

        remove_previous_checkpoint(&self.output_path)?;

        let count = self.written.len();
        let mut shards = Vec::with_capacity(count);
        let mut weight_map = BTreeMap::new();

        for (idx, (part_path, names)) in self.written.iter().enumerate() {
            let file_name = if count == 1 {
                SINGLE_SHARD_NAME.to_string()
            } else {
                format!("model-{:05}-of-{:05}.safetensors", idx + 1, count)
            };
            let final_path = self.output_path.join(&file_name);
            std::fs::rename(part_path, &final_path)?;
            info!("Writing shard: {:?}", final_path);

            for name in names {
                weight_map.insert(name.clone(), file_name.clone());
            }
            shards.push(final_path);
        }

        if count > 1 {
            let index = WeightIndex {
                metadata: IndexMetadata {
                    total_size: self.total_size,
                },
                weight_map,
            };
            std::fs::write(
                self.output_path.join(INDEX_FILE_NAME),
                serde_json::to_string_pretty(&index)?,
            )?;
        }

        Ok(shards)
    }
}

impl Drop for ShardedWriter {
    /// Remove shards that were never finalized, e.g. when a save fails
    /// half-way.
    fn drop(&mut self) {
        for (part_path, _) in &self.written {
            if part_path.exists() {
                debug!("Removing unfinished shard {:?}", part_path);
                let _ = std::fs::remove_file(part_path);
            }
        }
    }
}

/// Delete temporary shards an interrupted run left behind.
fn remove_stale_parts(dir: &Path) -> Result<(), PersistenceError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_part = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("model-") && n.ends_with(PART_SUFFIX));
        if is_part {
            debug!("Removing stale shard {:?}", path);
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Delete shards and index from an earlier run so a re-run with a different
/// shard count leaves no stale files behind.
fn remove_previous_checkpoint(dir: &Path) -> Result<(), PersistenceError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let is_shard = name == SINGLE_SHARD_NAME
            || (name.starts_with("model-") && name.contains("-of-") && name.ends_with(".safetensors"));
        if is_shard || name == INDEX_FILE_NAME {
            debug!("Removing previous checkpoint file {:?}", path);
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
