//! tiesforge CLI - TIES merging of fine-tuned checkpoints.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use tiesforge_merge::{
    FineTuneConfig, HfModelStore, HubProbe, JsonLinesSink, LocalProbe, MergeOrchestrator,
    MergekitEngine, ProgressBarSink, ProgressSink, SourceProbe, TracingSink,
    DEFAULT_MAX_SHARD_SIZE,
};
use tiesforge_merge::engine::DEFAULT_MERGEKIT_PROGRAM;

/// How progress is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum ProgressMode {
    /// One JSON object per line on stdout
    #[default]
    Json,
    /// Interactive progress bar
    Bar,
    /// Log lines on stderr
    Log,
}

#[derive(Parser)]
#[command(name = "tiesforge")]
#[command(author, version, about = "Merge fine-tuned checkpoints into an instruction-tuned model with TIES", long_about = None)]
struct Cli {
    /// Merge request file (YAML). Flags override its fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base model (HuggingFace ID or local path)
    #[arg(long)]
    base_model: Option<String>,

    /// Instruction-tuned target model (HuggingFace ID or local path)
    #[arg(long)]
    target_model: Option<String>,

    /// Fine-tuned checkpoint; repeat or pass several values
    #[arg(long = "finetune-output", alias = "finetune-outputs", num_args = 1..)]
    finetune_outputs: Vec<String>,

    /// Output directory for the merged model
    #[arg(short, long)]
    output_path: Option<PathBuf>,

    /// Weights per model: fine-tunes in order, then the target
    #[arg(long, num_args = 1.., allow_negative_numbers = true)]
    weights: Vec<String>,

    /// Densities per model: fine-tunes in order, then the target
    #[arg(long, num_args = 1.., allow_negative_numbers = true)]
    densities: Vec<String>,

    /// MergeKit command (may include leading arguments)
    #[arg(long, env = "MERGEKIT_BIN", default_value = DEFAULT_MERGEKIT_PROGRAM)]
    mergekit_bin: String,

    /// Directory for MergeKit's temporary output (defaults to the system
    /// temp dir)
    #[arg(long, env = "TIESFORGE_STAGING_DIR")]
    staging_dir: Option<PathBuf>,

    /// Extra argument passed to MergeKit (repeatable)
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// Never contact the HuggingFace Hub
    #[arg(long)]
    offline: bool,

    /// Progress output format
    #[arg(long, value_enum, default_value_t = ProgressMode::Json)]
    progress: ProgressMode,

    /// Maximum shard size in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_SHARD_SIZE)]
    max_shard_size: u64,

    /// Validate and print the merge plan without merging
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    /// Build the merge request from the config file and flags.
    fn merge_config(&self) -> anyhow::Result<FineTuneConfig> {
        let mut config = match &self.config {
            Some(path) => Some(FineTuneConfig::from_yaml_file(path)?),
            None => None,
        };

        if let Some(config) = config.as_mut() {
            if let Some(base) = &self.base_model {
                config.base_model_path = base.clone();
            }
            if let Some(target) = &self.target_model {
                config.target_model_path = target.clone();
            }
            if !self.finetune_outputs.is_empty() {
                config.finetune_outputs = self.finetune_outputs.clone();
            }
            if let Some(output) = &self.output_path {
                config.output_path = output.clone();
            }
        }

        let mut config = match config {
            Some(config) => config,
            None => {
                let (Some(base), Some(target), Some(output)) =
                    (&self.base_model, &self.target_model, &self.output_path)
                else {
                    bail!(
                        "--base-model, --target-model and --output-path are required without --config"
                    );
                };
                FineTuneConfig::new(
                    base.clone(),
                    target.clone(),
                    self.finetune_outputs.clone(),
                    output.clone(),
                )
            }
        };

        if !self.weights.is_empty() {
            config.weights = Some(parse_values("weights", &self.weights)?);
        }
        if !self.densities.is_empty() {
            config.densities = Some(parse_values("densities", &self.densities)?);
        }

        Ok(config)
    }

    fn engine(&self) -> anyhow::Result<MergekitEngine> {
        let engine = MergekitEngine::from_command_line(&self.mergekit_bin)
            .context("--mergekit-bin must not be empty")?;
        let engine = engine.with_extra_args(self.engine_args.iter().cloned());
        Ok(match &self.staging_dir {
            Some(dir) => engine.with_staging_root(dir),
            None => engine,
        })
    }

    fn probe(&self) -> Box<dyn SourceProbe> {
        if self.offline {
            Box::new(LocalProbe)
        } else {
            Box::new(HubProbe)
        }
    }

    fn sink(&self) -> Box<dyn ProgressSink> {
        match self.progress {
            ProgressMode::Json => Box::new(JsonLinesSink::stdout()),
            ProgressMode::Bar => Box::new(ProgressBarSink::new()),
            ProgressMode::Log => Box::new(TracingSink),
        }
    }
}

/// Parse `--weights 0.5,0.5 1.0` style values.
fn parse_values(name: &str, raw: &[String]) -> anyhow::Result<Vec<f32>> {
    raw.iter()
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f32>()
                .with_context(|| format!("invalid value in --{}: {:?}", name, s))
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries progress records only.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.merge_config()?;

    let store = if cli.offline {
        HfModelStore::offline()
    } else {
        HfModelStore::new()
    };
    let mut orchestrator = MergeOrchestrator::new(Box::new(cli.engine()?), Box::new(store), cli.sink())
        .with_probe(cli.probe())
        .with_max_shard_size(cli.max_shard_size);

    if cli.dry_run {
        let plan = orchestrator.plan(&config)?;
        print!("{}", plan.to_yaml()?);
        return Ok(());
    }

    let output = orchestrator.run(&config)?;
    eprintln!("Merge complete! Output saved to: {}", output.display());
    Ok(())
}
