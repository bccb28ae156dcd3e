//! Merge plan construction.
//!
//! A [`MergePlan`] is the fully specified, engine-agnostic description of a
//! TIES merge: which models take part, with which weight and density, which
//! model is the base, where the tokenizer comes from and which dtype the
//! result is stored in. Its YAML form is a MergeKit configuration document.

use serde::Serialize;

use crate::{check_parameter_counts, FineTuneConfig, MergeParameters, ModelParameters, Result};

/// Merge algorithm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    /// TIES-Merging (Yadav et al., 2023).
    Ties,
}

impl MergeMethod {
    /// Identifier understood by the merge engine.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ties => "ties",
        }
    }
}

/// Numeric precision of the merged weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    /// 32-bit IEEE float.
    Float32,
    /// 16-bit IEEE float.
    Float16,
    /// Brain float 16.
    Bfloat16,
}

impl Dtype {
    /// Name as written in `config.json` (`torch_dtype`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::Bfloat16 => "bfloat16",
        }
    }

    /// Matching safetensors storage dtype.
    pub fn to_safetensors(self) -> safetensors::Dtype {
        match self {
            Self::Float32 => safetensors::Dtype::F32,
            Self::Float16 => safetensors::Dtype::F16,
            Self::Bfloat16 => safetensors::Dtype::BF16,
        }
    }
}

/// The role a model plays in the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    /// A fine-tuned checkpoint at position `index` of the request.
    FineTune {
        /// Position in `finetune_outputs`.
        index: usize,
    },
    /// The instruction-tuned target model.
    Target,
}

/// One weighted entry of the plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedModel {
    /// Why this model is in the plan. Not part of the engine document; the
    /// position of the entry carries it there.
    #[serde(skip)]
    pub role: ModelRole,

    /// Model identifier.
    pub model: String,

    /// Per-model weight and density.
    pub parameters: ModelParameters,
}

/// Fully specified TIES merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergePlan {
    /// Fine-tuned checkpoints in request order, then the target model.
    pub models: Vec<PlannedModel>,

    /// Merge algorithm.
    pub merge_method: MergeMethod,

    /// Shared ancestor of every model in `models`.
    pub base_model: String,

    /// Global parameters; the base model only ever receives these.
    pub parameters: MergeParameters,

    /// Model the tokenizer is copied from.
    pub tokenizer_source: String,

    /// Output dtype.
    pub dtype: Dtype,
}

impl MergePlan {
    /// Render the plan as a MergeKit YAML configuration.
    pub fn to_yaml(&self) -> std::result::Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// The target model entry.
    pub fn target(&self) -> Option<&PlannedModel> {
        self.models.iter().find(|m| m.role == ModelRole::Target)
    }

    /// Fine-tuned checkpoint entries, in request order.
    pub fn finetunes(&self) -> impl Iterator<Item = &PlannedModel> {
        self.models
            .iter()
            .filter(|m| matches!(m.role, ModelRole::FineTune { .. }))
    }
}

/// Builds a [`MergePlan`] from a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanBuilder;

impl PlanBuilder {
    /// Create a plan builder.
    pub fn new() -> Self {
        Self
    }

    /// Build the plan for `config`.
    ///
    /// Pure and deterministic; performs no I/O. Missing weight or density
    /// vectors default to all ones. Structural problems (no fine-tuned
    /// checkpoints, wrongly sized vectors) are reported the same way the
    /// [`Validator`](crate::Validator) reports them.
    pub fn build(&self, config: &FineTuneConfig) -> Result<MergePlan> {
        check_parameter_counts(config)?;

        let count = config.expected_parameter_count();
        let weights = resolve(config.weights.as_deref(), count);
        let densities = resolve(config.densities.as_deref(), count);

        let mut models: Vec<PlannedModel> = config
            .finetune_outputs
            .iter()
            .enumerate()
            .map(|(index, model)| PlannedModel {
                role: ModelRole::FineTune { index },
                model: model.clone(),
                parameters: ModelParameters {
                    weight: weights[index],
                    density: densities[index],
                },
            })
            .collect();

        // The "+1" slot always belongs to the target model.
        let last = count - 1;
        models.push(PlannedModel {
            role: ModelRole::Target,
            model: config.target_model_path.clone(),
            parameters: ModelParameters {
                weight: weights[last],
                density: densities[last],
            },
        });

        Ok(MergePlan {
            models,
            merge_method: MergeMethod::Ties,
            base_model: config.base_model_path.clone(),
            parameters: MergeParameters::default(),
            tokenizer_source: config.finetune_outputs[0].clone(),
            dtype: Dtype::Bfloat16,
        })
    }
}

fn resolve(values: Option<&[f32]>, count: usize) -> Vec<f32> {
    values.map_or_else(|| vec![1.0; count], <[f32]>::to_vec)
}
