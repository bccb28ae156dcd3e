//! Configuration types for a merge request.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A merge request, typically built from CLI flags or loaded from YAML.
///
/// Weight and density vectors, when given, hold one entry per fine-tuned
/// checkpoint (in order) followed by one entry for the target model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuneConfig {
    /// Base model (local path or HuggingFace repo ID).
    #[serde(alias = "base_model")]
    pub base_model_path: String,

    /// Instruction-tuned target model.
    #[serde(alias = "target_model")]
    pub target_model_path: String,

    /// Fine-tuned checkpoints, in merge order.
    pub finetune_outputs: Vec<String>,

    /// Destination directory for the merged model and tokenizer.
    #[serde(alias = "output")]
    pub output_path: PathBuf,

    /// Per-model weights (`finetune_outputs.len() + 1` entries).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f32>>,

    /// Per-model densities (`finetune_outputs.len() + 1` entries).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub densities: Option<Vec<f32>>,
}

impl FineTuneConfig {
    /// Create a request with default (all 1.0) weights and densities.
    pub fn new(
        base_model: impl Into<String>,
        target_model: impl Into<String>,
        finetune_outputs: Vec<String>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base_model_path: base_model.into(),
            target_model_path: target_model.into(),
            finetune_outputs,
            output_path: output_path.into(),
            weights: None,
            densities: None,
        }
    }

    /// Set per-model weights.
    pub fn with_weights(mut self, weights: Vec<f32>) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Set per-model densities.
    pub fn with_densities(mut self, densities: Vec<f32>) -> Self {
        self.densities = Some(densities);
        self
    }

    /// Number of entries a weight or density vector must have.
    pub fn expected_parameter_count(&self) -> usize {
        self.finetune_outputs.len() + 1
    }

    /// Every model identifier in probe order: base, target, then fine-tunes.
    pub fn model_identifiers(&self) -> impl Iterator<Item = &str> {
        [self.base_model_path.as_str(), self.target_model_path.as_str()]
            .into_iter()
            .chain(self.finetune_outputs.iter().map(String::as_str))
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::MergeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// Parameters attached to one merged model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Contribution of this model to the merged parameters.
    pub weight: f32,

    /// Fraction of this model's parameter deltas kept before merging.
    pub density: f32,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            weight: 1.0,
            density: 1.0,
        }
    }
}

/// Global merge parameters, applied to the base model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergeParameters {
    /// Global weight.
    pub weight: f32,

    /// Global density.
    pub density: f32,

    /// Whether to normalize weights to sum to 1.
    pub normalize: bool,

    /// Use int8 mask for memory efficiency.
    pub int8_mask: bool,
}

impl Default for MergeParameters {
    fn default() -> Self {
        Self {
            weight: 1.0,
            density: 1.0,
            normalize: true,
            int8_mask: true,
        }
    }
}
