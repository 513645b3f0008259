use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use steptrace::{
    config::TrainConfig,
    models::token_mlp,
    recorder::Recorder,
    sharding::ShardPolicy,
    trainer::Trainer,
};
use tracing_subscriber::EnvFilter;

/// Runs warm-up and steady training steps, then records one profiled step and writes
/// its sorted per-layer trace.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON training config. Unset fields use defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Destination of the sorted trace, replaced if it exists.
    #[arg(short, long, default_value = "trace.log")]
    output: PathBuf,
    #[arg(long)]
    micro_batch_size: Option<usize>,
    #[arg(long)]
    max_sequence_length: Option<usize>,
    #[arg(long)]
    warmup_steps: Option<usize>,
    #[arg(long)]
    steady_steps: Option<usize>,
    #[arg(long)]
    use_sharding: bool,
    #[arg(long, value_enum)]
    shard_policy: Option<ShardPolicy>,
    /// -v for debug, -vv for trace. RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn load_config(&self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => TrainConfig::default(),
        };
        if let Some(v) = self.micro_batch_size {
            config.micro_batch_size = v;
        }
        if let Some(v) = self.max_sequence_length {
            config.max_sequence_length = v;
        }
        if let Some(v) = self.warmup_steps {
            config.warmup_steps = v;
        }
        if let Some(v) = self.steady_steps {
            config.steady_steps = v;
        }
        if self.use_sharding {
            config.use_sharding = true;
        }
        if let Some(policy) = self.shard_policy {
            config.shard_policy = policy;
        }
        config.validate().context("Invalid config")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .init();

    let config = args.load_config()?;
    let model = token_mlp(&config);
    let mut trainer = Trainer::new(config, model, Recorder::new())?;
    let lines = trainer
        .train(&args.output)
        .with_context(|| format!("Training run for {} failed", args.output.display()))?;

    println!("Wrote {} events to {}", lines.len(), args.output.display());
    Ok(())
}
