//! TIES merge orchestration for fine-tuned checkpoints.
//!
//! This crate takes a base model, an instruction-tuned target model and a set
//! of checkpoints fine-tuned from the same base, and turns them into a single
//! merged checkpoint plus tokenizer:
//!
//! - [`Validator`] checks the request before any expensive work starts
//! - [`PlanBuilder`] produces the engine-agnostic [`MergePlan`]
//! - a [`MergeEngine`] performs the actual TIES merge (by default the external
//!   `mergekit-yaml` executable, see [`MergekitEngine`])
//! - a [`ModelStore`] writes sharded safetensors and copies the tokenizer
//! - [`MergeOrchestrator`] sequences all of the above and reports progress
//!   through a [`ProgressSink`]
//!
//! # Example
//!
//! ```ignore
//! use tiesforge_merge::{
//!     FineTuneConfig, HfModelStore, JsonLinesSink, MergeOrchestrator, MergekitEngine,
//! };
//!
//! let config = FineTuneConfig::new(
//!     "meta-llama/Llama-3.2-1B",
//!     "meta-llama/Llama-3.2-1B-Instruct",
//!     vec!["./runs/math".into(), "./runs/code".into()],
//!     "./merged",
//! )
//! .with_weights(vec![0.5, 0.5, 1.0]);
//!
//! let mut orchestrator = MergeOrchestrator::new(
//!     Box::new(MergekitEngine::default()),
//!     Box::new(HfModelStore::new()),
//!     Box::new(JsonLinesSink::stdout()),
//! );
//! orchestrator.run(&config)?;
//! ```

#![warn(missing_docs)]

mod config;
pub mod engine;
mod error;
mod loader;
mod orchestrator;
mod plan;
mod progress;
mod source;
pub mod store;
mod tensor;
mod validate;

pub use config::*;
pub use error::*;
pub use loader::*;
pub use orchestrator::*;
pub use plan::*;
pub use progress::*;
pub use source::*;
pub use tensor::*;
pub use validate::*;

/// Re-export engines and stores for convenience
pub use engine::{InMemoryModel, MergeEngine, MergedModel, MergekitEngine};
pub use store::{HfModelStore, ModelStore, ShardedWriter, TokenizerFiles, DEFAULT_MAX_SHARD_SIZE};
