//! Merge orchestration.
//!
//! [`MergeOrchestrator`] drives one merge through a linear state machine:
//!
//! ```text
//! Init → Validated → PlanBuilt → Merged → ModelSaved → TokenizerSaved → Done
//!   │        │           │          │          │              │
//!   └────────┴───────────┴──────────┴──────────┴──────────────┴→ Failed
//! ```
//!
//! Every step is sequential and reports progress at its boundaries. Any error
//! moves the run to `Failed`, is reported through the progress channel and is
//! returned to the caller.

use std::path::{Path, PathBuf};

use serde::{Serialize, Serializer};
use tracing::{error, info};

use crate::engine::MergeEngine;
use crate::store::{ModelStore, DEFAULT_MAX_SHARD_SIZE};
use crate::{
    ErrorKind, FineTuneConfig, HubProbe, MergePlan, PersistenceError, PlanBuilder, ProgressReporter,
    ProgressSink, Result, SourceProbe, Validator,
};

/// Phase of a merge run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergePhase {
    /// Nothing has happened yet.
    Init,
    /// The request passed validation and the output directory exists.
    Validated,
    /// The merge plan has been built.
    PlanBuilt,
    /// The merge engine produced a merged model.
    Merged,
    /// Model shards are on disk.
    ModelSaved,
    /// Tokenizer files are on disk.
    TokenizerSaved,
    /// The run finished successfully.
    Done,
    /// The run stopped on an error.
    Failed {
        /// What went wrong.
        kind: ErrorKind,
    },
}

impl MergePhase {
    /// Snake-case name, as used in progress records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Validated => "validated",
            Self::PlanBuilt => "plan_built",
            Self::Merged => "merged",
            Self::ModelSaved => "model_saved",
            Self::TokenizerSaved => "tokenizer_saved",
            Self::Done => "done",
            Self::Failed { .. } => "failed",
        }
    }

    /// Returns `true` for `Done` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }

    /// Error kind of a failed run.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Failed { kind } => Some(*kind),
            _ => None,
        }
    }

    /// The phase that follows this one on success.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Init => Some(Self::Validated),
            Self::Validated => Some(Self::PlanBuilt),
            Self::PlanBuilt => Some(Self::Merged),
            Self::Merged => Some(Self::ModelSaved),
            Self::ModelSaved => Some(Self::TokenizerSaved),
            Self::TokenizerSaved => Some(Self::Done),
            Self::Done | Self::Failed { .. } => None,
        }
    }
}

impl Serialize for MergePhase {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for MergePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs merges end to end.
pub struct MergeOrchestrator {
    engine: Box<dyn MergeEngine>,
    store: Box<dyn ModelStore>,
    probe: Box<dyn SourceProbe>,
    reporter: ProgressReporter,
    max_shard_size: u64,
    phase: MergePhase,
}

impl MergeOrchestrator {
    /// Create an orchestrator. Identifiers are probed with [`HubProbe`] and
    /// shards are capped at [`DEFAULT_MAX_SHARD_SIZE`].
    pub fn new(
        engine: Box<dyn MergeEngine>,
        store: Box<dyn ModelStore>,
        sink: Box<dyn ProgressSink>,
    ) -> Self {
        Self {
            engine,
            store,
            probe: Box::new(HubProbe),
            reporter: ProgressReporter::new(sink),
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
            phase: MergePhase::Init,
        }
    }

    /// Use a different existence probe.
    pub fn with_probe(mut self, probe: Box<dyn SourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Set maximum shard size in bytes.
    pub fn with_max_shard_size(mut self, size: u64) -> Self {
        self.max_shard_size = size;
        self
    }

    /// Phase reached by the most recent run.
    pub fn phase(&self) -> MergePhase {
        self.phase
    }

    /// Validate `config` and build its plan without touching the filesystem.
    pub fn plan(&self, config: &FineTuneConfig) -> Result<MergePlan> {
        Validator::new(self.probe.as_ref()).validate(config)?;
        PlanBuilder::new().build(config)
    }

    /// Run a merge. Returns the output directory on success.
    pub fn run(&mut self, config: &FineTuneConfig) -> Result<PathBuf> {
        self.phase = MergePhase::Init;
        self.reporter.begin();

        match self.execute(config) {
            Ok(output) => Ok(output),
            Err(err) => {
                let failed_in = self.phase;
                self.phase = MergePhase::Failed { kind: err.kind() };
                error!(phase = %failed_in, "Merge failed: {}", err);
                let fraction = self.reporter.fraction();
                self.reporter
                    .report(self.phase, fraction, format!("Error: {}", err));
                Err(err)
            }
        }
    }

    fn execute(&mut self, config: &FineTuneConfig) -> Result<PathBuf> {
        self.report(0.0, "Starting merge process");

        Validator::new(self.probe.as_ref()).validate(config)?;
        prepare_output_dir(&config.output_path)?;
        self.advance(MergePhase::Validated, 10.0, "Configuration validated");

        let plan = PlanBuilder::new().build(config)?;
        info!(
            "Merging {} models onto {} with method {} (engine: {})",
            plan.models.len(),
            plan.base_model,
            plan.merge_method.as_str(),
            self.engine.name()
        );
        self.advance(MergePhase::PlanBuilt, 20.0, "Merge plan prepared");

        self.report(30.0, "Starting merge");
        let merged = self.engine.merge(&plan)?;
        self.advance(MergePhase::Merged, 70.0, "Merge engine finished");

        self.report(80.0, "Saving merged model");
        let shards = self.store.save_model(
            merged.as_ref(),
            &config.output_path,
            self.max_shard_size,
            plan.dtype,
        )?;
        drop(merged);
        info!("Wrote {} model shard(s)", shards.len());
        self.advance(MergePhase::ModelSaved, 90.0, "Saving tokenizer");

        let tokenizer = self.store.load_tokenizer(&plan.tokenizer_source)?;
        self.store.save_tokenizer(&tokenizer, &config.output_path)?;
        self.phase = MergePhase::TokenizerSaved;

        info!("Merge complete! Output saved to: {:?}", config.output_path);
        self.advance(MergePhase::Done, 100.0, "Merge completed successfully");
        Ok(config.output_path.clone())
    }

    fn advance(&mut self, next: MergePhase, fraction: f32, status: &str) {
        debug_assert_eq!(self.phase.next(), Some(next));
        self.phase = next;
        self.report(fraction, status);
    }

    fn report(&mut self, fraction: f32, status: &str) {
        self.reporter.report(self.phase, fraction, status);
    }
}

/// Create the output directory if it does not exist yet. Existing contents
/// are left alone.
pub fn prepare_output_dir(path: &Path) -> std::result::Result<(), PersistenceError> {
    std::fs::create_dir_all(path)?;
    Ok(())
}
