//! End-to-end merge pipeline tests.
//!
//! These run the orchestrator against local model directories with fake
//! engines, covering:
//! - the full success path (shards, config, tokenizer, progress)
//! - validation failures leaving the filesystem untouched
//! - engine failures leaving no model or tokenizer files behind
//! - re-running into an existing output directory

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};

use tiesforge_merge::{
    ChannelSink, EngineError, ErrorKind, FineTuneConfig, HfModelStore, InMemoryModel, LocalProbe,
    MergeEngine, MergeError, MergeOrchestrator, MergePhase, MergePlan, MergedModel,
    ProgressUpdate, SafetensorsModel, TensorBuf,
};

const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {"[UNK]": 0, "hello": 1, "world": 2},
    "unk_token": "[UNK]"
  }
}"#;

/// Engine that returns a fixed model and records the plans it saw.
#[derive(Clone, Default)]
struct FixedEngine {
    plans: Arc<Mutex<Vec<MergePlan>>>,
}

impl MergeEngine for FixedEngine {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn merge(&self, plan: &MergePlan) -> Result<Box<dyn MergedModel>, EngineError> {
        self.plans.lock().unwrap().push(plan.clone());
        let model = InMemoryModel::new()
            .with_tensor(
                "model.embed_tokens.weight",
                TensorBuf::from_f32(vec![3, 2], &[0.0, 0.5, 1.0, 1.5, 2.0, 2.5]),
            )
            .with_tensor("lm_head.weight", TensorBuf::from_f32(vec![2], &[-1.0, 1.0]))
            .with_config(serde_json::json!({
                "architectures": ["LlamaForCausalLM"],
                "torch_dtype": "float32",
            }));
        Ok(Box::new(model))
    }
}

struct FailingEngine;

impl MergeEngine for FailingEngine {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn merge(&self, _plan: &MergePlan) -> Result<Box<dyn MergedModel>, EngineError> {
        Err(EngineError::Other("CUDA out of memory".to_string()))
    }
}

/// Local base, target and fine-tuned model directories.
struct Workspace {
    root: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        for name in ["base", "target", "ftA", "ftB"] {
            std::fs::create_dir_all(root.path().join(name)).unwrap();
        }
        std::fs::write(root.path().join("ftA").join("tokenizer.json"), TOKENIZER_JSON).unwrap();
        std::fs::write(
            root.path().join("ftA").join("tokenizer_config.json"),
            r#"{"model_max_length": 128}"#,
        )
        .unwrap();
        Self { root }
    }

    fn model(&self, name: &str) -> String {
        self.root.path().join(name).to_str().unwrap().to_string()
    }

    fn output(&self) -> PathBuf {
        self.root.path().join("merged")
    }

    fn config(&self) -> FineTuneConfig {
        FineTuneConfig::new(
            self.model("base"),
            self.model("target"),
            vec![self.model("ftA"), self.model("ftB")],
            self.output(),
        )
    }
}

fn orchestrator(engine: Box<dyn MergeEngine>) -> (MergeOrchestrator, mpsc::Receiver<ProgressUpdate>) {
    let (sink, rx) = ChannelSink::new();
    let orchestrator = MergeOrchestrator::new(engine, Box::new(HfModelStore::offline()), Box::new(sink))
        .with_probe(Box::new(LocalProbe));
    (orchestrator, rx)
}

fn list_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    files.sort();
    files
}

#[test]
fn test_successful_merge_writes_self_contained_directory() {
    let ws = Workspace::new();
    let engine = FixedEngine::default();
    let (mut orchestrator, rx) = orchestrator(Box::new(engine.clone()));

    let config = ws.config().with_weights(vec![0.5, 0.5, 1.0]).with_densities(vec![0.3, 0.3, 0.5]);
    let output = orchestrator.run(&config).unwrap();
    assert_eq!(output, ws.output());
    assert_eq!(orchestrator.phase(), MergePhase::Done);

    assert_eq!(
        list_files(&output),
        vec!["config.json", "model.safetensors", "tokenizer.json", "tokenizer_config.json"]
    );

    let saved = SafetensorsModel::open(&output).unwrap();
    let embed = saved.load_tensor("model.embed_tokens.weight").unwrap();
    assert_eq!(embed.dtype, safetensors::Dtype::BF16);
    assert_eq!(embed.shape, vec![3, 2]);
    assert_eq!(saved.model_config().unwrap()["torch_dtype"], "bfloat16");

    let plans = engine.plans.lock().unwrap();
    assert_eq!(plans.len(), 1);
    let summary: Vec<(String, f32, f32)> = plans[0]
        .models
        .iter()
        .map(|m| (m.model.clone(), m.parameters.weight, m.parameters.density))
        .collect();
    assert_eq!(
        summary,
        vec![
            (ws.model("ftA"), 0.5, 0.3),
            (ws.model("ftB"), 0.5, 0.3),
            (ws.model("target"), 1.0, 0.5),
        ]
    );
    assert_eq!(plans[0].base_model, ws.model("base"));
    assert_eq!(plans[0].tokenizer_source, ws.model("ftA"));

    let updates: Vec<ProgressUpdate> = rx.try_iter().collect();
    let fractions: Vec<f32> = updates.iter().map(|u| u.progress).collect();
    assert_eq!(fractions, vec![0.0, 10.0, 20.0, 30.0, 70.0, 80.0, 90.0, 100.0]);
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    let last = updates.last().unwrap();
    assert_eq!(last.phase, MergePhase::Done);
    assert_eq!(last.status, "Merge completed successfully");
}

#[test]
fn test_small_shard_limit_writes_index() {
    let ws = Workspace::new();
    let (orchestrator, _rx) = orchestrator(Box::new(FixedEngine::default()));
    let mut orchestrator = orchestrator.with_max_shard_size(8);

    let output = orchestrator.run(&ws.config()).unwrap();
    let files = list_files(&output);
    assert!(files.contains(&"model-00001-of-00002.safetensors".to_string()));
    assert!(files.contains(&"model-00002-of-00002.safetensors".to_string()));
    assert!(files.contains(&"model.safetensors.index.json".to_string()));
    assert!(!files.contains(&"model.safetensors".to_string()));
}

#[test]
fn test_parameter_count_mismatch_is_rejected() {
    let ws = Workspace::new();
    let engine = FixedEngine::default();
    let (mut orchestrator, rx) = orchestrator(Box::new(engine.clone()));

    let config = ws.config().with_weights(vec![0.5, 0.5]);
    let err = orchestrator.run(&config).unwrap_err();
    assert!(matches!(
        err,
        MergeError::ParameterCountMismatch {
            parameter: "weights",
            expected: 3,
            actual: 2
        }
    ));
    assert_eq!(
        orchestrator.phase(),
        MergePhase::Failed {
            kind: ErrorKind::ParameterCountMismatch
        }
    );
    assert!(engine.plans.lock().unwrap().is_empty());

    let last = rx.try_iter().last().unwrap();
    assert!(last.phase.is_terminal());
    assert!(last.status.starts_with("Error:"));
}

#[test]
fn test_missing_base_model_creates_nothing() {
    let ws = Workspace::new();
    let (mut orchestrator, _rx) = orchestrator(Box::new(FixedEngine::default()));

    let mut config = ws.config();
    config.base_model_path = ws.model("does-not-exist");

    let err = orchestrator.run(&config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);
    assert!(err.to_string().contains("does-not-exist"));
    assert!(!ws.output().exists());
}

#[test]
fn test_engine_failure_leaves_no_artifacts() {
    let ws = Workspace::new();
    let (mut orchestrator, rx) = orchestrator(Box::new(FailingEngine));

    let err = orchestrator.run(&ws.config()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MergeEngineFailure);
    assert_eq!(
        orchestrator.phase(),
        MergePhase::Failed {
            kind: ErrorKind::MergeEngineFailure
        }
    );

    // The directory exists (it is created once validation passes) but holds
    // neither weights nor tokenizer.
    assert!(ws.output().is_dir());
    assert!(list_files(&ws.output()).is_empty());

    let updates: Vec<ProgressUpdate> = rx.try_iter().collect();
    let last = updates.last().unwrap();
    assert_eq!(last.status, "Error: Merge engine failed: CUDA out of memory");
    assert_eq!(last.progress, 30.0);
    assert!(updates.windows(2).all(|w| w[0].progress <= w[1].progress));
}

#[test]
fn test_missing_tokenizer_is_a_persistence_failure() {
    let ws = Workspace::new();
    std::fs::remove_file(ws.root.path().join("ftA").join("tokenizer.json")).unwrap();
    std::fs::remove_file(ws.root.path().join("ftA").join("tokenizer_config.json")).unwrap();
    let (mut orchestrator, _rx) = orchestrator(Box::new(FixedEngine::default()));

    let err = orchestrator.run(&ws.config()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PersistenceFailure);
    assert_eq!(
        orchestrator.phase(),
        MergePhase::Failed {
            kind: ErrorKind::PersistenceFailure
        }
    );
}

#[test]
fn test_rerun_keeps_unrelated_files() {
    let ws = Workspace::new();
    std::fs::create_dir_all(ws.output()).unwrap();
    std::fs::write(ws.output().join("NOTES.md"), "merge log").unwrap();

    let (mut orchestrator, rx) = orchestrator(Box::new(FixedEngine::default()));
    orchestrator.run(&ws.config()).unwrap();
    orchestrator.run(&ws.config()).unwrap();

    assert_eq!(
        std::fs::read_to_string(ws.output().join("NOTES.md")).unwrap(),
        "merge log"
    );
    // Each run starts its progress over from zero.
    let starts = rx.try_iter().filter(|u| u.progress == 0.0).count();
    assert_eq!(starts, 2);
}

#[test]
fn test_dry_run_plan_touches_nothing() {
    let ws = Workspace::new();
    let engine = FixedEngine::default();
    let (orchestrator, rx) = orchestrator(Box::new(engine.clone()));

    let plan = orchestrator.plan(&ws.config()).unwrap();
    assert_eq!(plan.models.len(), 3);
    assert!(plan.to_yaml().unwrap().contains("merge_method: ties"));

    assert!(!ws.output().exists());
    assert!(engine.plans.lock().unwrap().is_empty());
    assert!(rx.try_iter().next().is_none());
}
