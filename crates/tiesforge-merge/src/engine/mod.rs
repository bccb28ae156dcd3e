//! Merge engines.
//!
//! The TIES mathematics itself lives outside this crate. A [`MergeEngine`]
//! receives a fully specified [`MergePlan`] and hands back the merged weights
//! as a [`MergedModel`], which the store then reshards into the output
//! directory.
//!
//! - [`MergekitEngine`]: runs the external `mergekit-yaml` executable
//! - [`InMemoryModel`]: a merged model assembled in memory, for engines that
//!   compute results directly (and for tests)

mod mergekit;

pub use mergekit::{MergekitEngine, DEFAULT_MERGEKIT_PROGRAM};

use std::collections::BTreeMap;

use crate::{EngineError, MergePlan, PersistenceError, TensorBuf};

/// Trait for merge engine implementations.
pub trait MergeEngine: Send + Sync {
    /// Name of the engine.
    fn name(&self) -> &'static str;

    /// Execute `plan`.
    ///
    /// The call is treated as atomic: it either returns the complete merged
    /// model or an error, and may run for a long time.
    fn merge(&self, plan: &MergePlan) -> Result<Box<dyn MergedModel>, EngineError>;
}

/// Handle to the weights produced by a merge engine.
pub trait MergedModel: Send {
    /// Get the names of all tensors in the model.
    fn tensor_names(&self) -> Vec<String>;

    /// Load a tensor by name.
    fn load_tensor(&self, name: &str) -> Result<TensorBuf, PersistenceError>;

    /// Model configuration (`config.json`), if the engine produced one.
    fn model_config(&self) -> Option<&serde_json::Value> {
        None
    }
}

/// A merged model held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryModel {
    tensors: BTreeMap<String, TensorBuf>,
    config: Option<serde_json::Value>,
}

impl InMemoryModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tensor.
    pub fn with_tensor(mut self, name: impl Into<String>, tensor: TensorBuf) -> Self {
        self.tensors.insert(name.into(), tensor);
        self
    }

    /// Attach a model configuration.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }
}

impl MergedModel for InMemoryModel {
    fn tensor_names(&self) -> Vec<String> {
        self.tensors.keys().cloned().collect()
    }

    fn load_tensor(&self, name: &str) -> Result<TensorBuf, PersistenceError> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| PersistenceError::TensorNotFound(name.to_string()))
    }

    fn model_config(&self) -> Option<&serde_json::Value> {
        self.config.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_model() {
        let model = InMemoryModel::new()
            .with_tensor("b", TensorBuf::from_f32(vec![1], &[2.0]))
            .with_tensor("a", TensorBuf::from_f32(vec![1], &[1.0]))
            .with_config(serde_json::json!({"model_type": "llama"}));

        assert_eq!(model.tensor_names(), vec!["a", "b"]);
        assert_eq!(model.load_tensor("b").unwrap().to_f32_vec().unwrap(), vec![2.0]);
        assert!(model.load_tensor("c").is_err());
        assert_eq!(model.model_config().unwrap()["model_type"], "llama");
    }
}
