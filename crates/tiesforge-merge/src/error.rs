//! Error types for merge orchestration.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Errors that can end a merge run.
#[derive(Debug, Error)]
pub enum MergeError {
    /// An input model identifier does not resolve to an existing artifact.
    #[error("Path does not exist: {path}")]
    InvalidPath {
        /// The offending identifier, as given in the configuration.
        path: String,
    },

    /// A weight or density vector does not have one entry per merged model.
    #[error(
        "Number of {parameter} must match number of models (including target): \
         expected {expected}, got {actual}"
    )]
    ParameterCountMismatch {
        /// Which vector is wrong (`weights` or `densities`).
        parameter: &'static str,
        /// `len(finetune_outputs) + 1`.
        expected: usize,
        /// Length actually supplied.
        actual: usize,
    },

    /// Not enough fine-tuned checkpoints to build a merge.
    #[error("Expected at least {expected} fine-tuned models, got {actual}")]
    NotEnoughModels {
        /// Minimum number of fine-tuned checkpoints.
        expected: usize,
        /// Number supplied.
        actual: usize,
    },

    /// The merge engine failed to produce a merged model.
    #[error("Merge engine failed: {0}")]
    MergeEngine(#[from] EngineError),

    /// Writing the merged model or tokenizer failed.
    #[error("Failed to persist merge output: {0}")]
    Persistence(#[from] PersistenceError),

    /// The configuration file could not be read or parsed.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl MergeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPath { .. } => ErrorKind::InvalidPath,
            Self::ParameterCountMismatch { .. } => ErrorKind::ParameterCountMismatch,
            Self::NotEnoughModels { .. } => ErrorKind::NotEnoughModels,
            Self::MergeEngine(_) => ErrorKind::MergeEngineFailure,
            Self::Persistence(_) => ErrorKind::PersistenceFailure,
            Self::Config(_) => ErrorKind::InvalidConfig,
        }
    }

    /// Whether the error was raised before any merge work started.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidPath
                | ErrorKind::ParameterCountMismatch
                | ErrorKind::NotEnoughModels
                | ErrorKind::InvalidConfig
        )
    }
}

impl From<serde_yaml::Error> for MergeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Coarse error classification carried by a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`MergeError::InvalidPath`].
    InvalidPath,
    /// See [`MergeError::ParameterCountMismatch`].
    ParameterCountMismatch,
    /// See [`MergeError::NotEnoughModels`].
    NotEnoughModels,
    /// See [`MergeError::MergeEngine`].
    MergeEngineFailure,
    /// See [`MergeError::Persistence`].
    PersistenceFailure,
    /// See [`MergeError::Config`].
    InvalidConfig,
}

/// Errors raised by a merge engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine executable could not be started.
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        /// Program that was invoked.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The engine executable ran but reported failure.
    #[error("`{program}` exited with {status}: {stderr}")]
    Exited {
        /// Program that was invoked.
        program: String,
        /// Exit status as reported by the OS.
        status: String,
        /// Tail of the captured standard error.
        stderr: String,
    },

    /// Preparing the staging directory or plan file failed.
    #[error("failed to stage merge plan: {0}")]
    Staging(#[from] std::io::Error),

    /// The plan could not be rendered for the engine.
    #[error("failed to render merge plan: {0}")]
    Plan(#[from] serde_yaml::Error),

    /// The engine finished but its output is unusable.
    #[error("unreadable engine output: {0}")]
    Output(#[source] PersistenceError),

    /// Any other engine-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Errors raised while reading or writing model artifacts.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Safetensors error.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// JSON error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// HuggingFace Hub error.
    #[error("Hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    /// Tokenizer files are missing or corrupt.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// A model directory contains no weights.
    #[error("No safetensors files found in {0:?}")]
    MissingWeights(PathBuf),

    /// Tensor not found in model.
    #[error("Tensor not found: {0}")]
    TensorNotFound(String),
}

/// Result type for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
