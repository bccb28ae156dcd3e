//! Merge engine backed by the external MergeKit `mergekit-yaml` command.
//!
//! The plan is written as a MergeKit YAML document into a private staging
//! directory, `mergekit-yaml <plan> <out>` is run to completion, and the
//! resulting safetensors are exposed as a [`MergedModel`]. The staging
//! directory is removed when the returned model is dropped.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use tracing::{debug, info};

use super::{MergeEngine, MergedModel};
use crate::{EngineError, MergePlan, PersistenceError, SafetensorsModel, TensorBuf};

/// Default MergeKit entry point.
pub const DEFAULT_MERGEKIT_PROGRAM: &str = "mergekit-yaml";

/// Number of trailing stderr lines kept in error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Runs merges with MergeKit.
#[derive(Debug, Clone)]
pub struct MergekitEngine {
    program: String,
    leading_args: Vec<String>,
    extra_args: Vec<String>,
    staging_root: Option<PathBuf>,
}

impl Default for MergekitEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MERGEKIT_PROGRAM)
    }
}

impl MergekitEngine {
    /// Use `program` as the MergeKit entry point.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            extra_args: Vec::new(),
            staging_root: None,
        }
    }

    /// Build from a whitespace-separated command line, e.g.
    /// `"python -m mergekit.scripts.run_yaml"`.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        let mut engine = Self::new(program);
        engine.leading_args = parts.collect();
        Some(engine)
    }

    /// Arguments appended after the plan and output paths (e.g. `--cuda`).
    pub fn with_extra_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    /// Create staging directories under `root` instead of the system temp dir.
    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    /// Directory staging directories are created in, if not the system
    /// temp dir.
    pub fn staging_root(&self) -> Option<&Path> {
        self.staging_root.as_deref()
    }

    fn staging_dir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("tiesforge-");
        match &self.staging_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
    }
}

impl MergeEngine for MergekitEngine {
    fn name(&self) -> &'static str {
        "mergekit"
    }

    fn merge(&self, plan: &MergePlan) -> Result<Box<dyn MergedModel>, EngineError> {
        let staging = self.staging_dir()?;
        let plan_path = staging.path().join("merge.yaml");
        let output_dir = staging.path().join("merged");
        std::fs::write(&plan_path, plan.to_yaml()?)?;

        info!("Running {} with plan {:?}", self.program, plan_path);
        let output = Command::new(&self.program)
            .args(&self.leading_args)
            .arg(&plan_path)
            .arg(&output_dir)
            .args(&self.extra_args)
            .output()
            .map_err(|source| EngineError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(target: "tiesforge::mergekit", "{}", line);
        }

        if !output.status.success() {
            return Err(EngineError::Exited {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        let model = SafetensorsModel::open(&output_dir).map_err(EngineError::Output)?;
        info!("{} produced {} tensors", self.program, model.len());

        Ok(Box::new(StagedModel {
            model,
            _staging: staging,
        }))
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Engine output that keeps its staging directory alive.
struct StagedModel {
    // Declared before `_staging` so the mappings are released before the
    // directory is deleted.
    model: SafetensorsModel,
    _staging: TempDir,
}

impl MergedModel for StagedModel {
    fn tensor_names(&self) -> Vec<String> {
        self.model.tensor_names()
    }

    fn load_tensor(&self, name: &str) -> Result<TensorBuf, PersistenceError> {
        self.model.load_tensor(name)
    }

    fn model_config(&self) -> Option<&serde_json::Value> {
        self.model.model_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FineTuneConfig, PlanBuilder};

    fn plan() -> MergePlan {
        let config = FineTuneConfig::new("base", "target", vec!["ftA".to_string()], "out");
        PlanBuilder::new().build(&config).unwrap()
    }

    #[test]
    fn test_from_command_line() {
        let engine = MergekitEngine::from_command_line("python -m mergekit.scripts.run_yaml").unwrap();
        assert_eq!(engine.program, "python");
        assert_eq!(engine.leading_args, vec!["-m", "mergekit.scripts.run_yaml"]);
        assert!(MergekitEngine::from_command_line("   ").is_none());
    }

    #[test]
    fn test_stderr_tail() {
        let stderr: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let tail = stderr_tail(stderr.as_bytes());
        assert!(tail.starts_with("line 10"));
        assert!(tail.ends_with("line 29"));
    }

    #[test]
    fn test_missing_program() {
        let engine = MergekitEngine::new("tiesforge-definitely-not-installed");
        assert!(matches!(
            engine.merge(&plan()),
            Err(EngineError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_program() {
        let staging_root = tempfile::tempdir().unwrap();
        let script = staging_root.path().join("fail.sh");
        std::fs::write(&script, "echo 'CUDA out of memory' >&2\nexit 3\n").unwrap();

        let engine = MergekitEngine::from_command_line(&format!("sh {}", script.display()))
            .unwrap()
            .with_staging_root(staging_root.path());
        match engine.merge(&plan()) {
            Err(EngineError::Exited { stderr, .. }) => assert!(stderr.contains("out of memory")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("merge should have failed"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_successful_program_output_is_loaded() {
        let fixtures = tempfile::tempdir().unwrap();
        let weights = fixtures.path().join("weights.safetensors");
        let tensor = TensorBuf::from_f32(vec![2], &[0.25, 0.75]);
        let view =
            safetensors::tensor::TensorView::new(tensor.dtype, tensor.shape.clone(), &tensor.data)
                .unwrap();
        safetensors::serialize_to_file(vec![("merged.weight", view)], &None, &weights).unwrap();

        // Stand-in for mergekit-yaml: keep the plan, emit one shard.
        let captured_plan = fixtures.path().join("captured.yaml");
        let script = fixtures.path().join("fake-mergekit.sh");
        std::fs::write(
            &script,
            format!(
                "cp \"$1\" {plan}\nmkdir -p \"$2\"\ncp {weights} \"$2/model.safetensors\"\n",
                plan = captured_plan.display(),
                weights = weights.display(),
            ),
        )
        .unwrap();

        let engine = MergekitEngine::from_command_line(&format!("sh {}", script.display()))
            .unwrap()
            .with_staging_root(fixtures.path());
        let merged = engine.merge(&plan()).unwrap();

        assert_eq!(merged.tensor_names(), vec!["merged.weight"]);
        assert_eq!(
            merged.load_tensor("merged.weight").unwrap().to_f32_vec().unwrap(),
            vec![0.25, 0.75]
        );

        let yaml = std::fs::read_to_string(&captured_plan).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(doc["merge_method"].as_str(), Some("ties"));
        assert_eq!(doc["tokenizer_source"].as_str(), Some("ftA"));
    }
}
