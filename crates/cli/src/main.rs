mod logging;
mod simulate;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use mlora_core::RunConfig;

use crate::logging::LogFormat;
use crate::simulate::SimulateOptions;

#[derive(Parser)]
#[command(name = "mlora", about = "Multi-adapter batch routing driver")]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a run file and list its adapters
    Check {
        /// Path to the JSON run file
        #[arg(long)]
        config: PathBuf,
    },
    /// Route synthetic requests through a randomly initialized model
    Simulate {
        /// Path to the JSON run file
        #[arg(long)]
        config: PathBuf,

        /// Number of frozen feed-forward layers
        #[arg(long, default_value_t = 2)]
        layers: usize,

        /// Hidden size of the frozen model
        #[arg(long, default_value_t = 64)]
        hidden: usize,

        /// Intermediate size of each feed-forward layer
        #[arg(long, default_value_t = 128)]
        intermediate: usize,

        /// Vocabulary size of the random embedding
        #[arg(long, default_value_t = 512)]
        vocab: usize,

        /// Number of synthetic requests, spread over the adapters in order
        #[arg(long, default_value_t = 32)]
        requests: usize,

        /// Longest synthetic request in tokens
        #[arg(long, default_value_t = 32)]
        max_request_len: usize,

        /// Seed for weights and requests; omitted means a fresh seed
        #[arg(long)]
        seed: Option<u64>,

        /// Override `max_rows` from the run file
        #[arg(long)]
        max_rows: Option<usize>,

        /// Collect router logits and report auxiliary losses
        #[arg(long)]
        router_logits: bool,

        /// Run batches in inference mode
        #[arg(long)]
        inference: bool,

        /// Greedy decoding steps per batch; needs --inference
        #[arg(long, default_value_t = 0)]
        max_new_tokens: usize,

        /// Token id that ends decoding for a row
        #[arg(long)]
        eos_id: Option<u32>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_with_level_and_format(&cli.log_level, LogFormat::from_env())?;

    match cli.command {
        Command::Check { config } => {
            let run = load_run_config(&config)?;
            for line in describe(&run) {
                println!("{line}");
            }
        }
        Command::Simulate {
            config,
            layers,
            hidden,
            intermediate,
            vocab,
            requests,
            max_request_len,
            seed,
            max_rows,
            router_logits,
            inference,
            max_new_tokens,
            eos_id,
        } => {
            let run = load_run_config(&config)?;
            let opts = SimulateOptions {
                layers,
                hidden,
                intermediate,
                vocab,
                requests,
                max_request_len,
                seed,
                max_rows,
                router_logits,
                inference,
                max_new_tokens,
                eos_id,
            };
            let report = simulate::run(&run, &opts)?;
            println!("{}", serde_json::to_string_pretty(&report.to_json())?);
        }
    }
    Ok(())
}

fn load_run_config(path: &Path) -> anyhow::Result<RunConfig> {
    let run = RunConfig::from_file(path)
        .with_context(|| format!("failed to load run file {}", path.display()))?;
    run.validate()
        .with_context(|| format!("invalid run file {}", path.display()))?;
    Ok(run)
}

/// One summary line for the run plus one per adapter.
fn describe(run: &RunConfig) -> Vec<String> {
    let mut lines = vec![format!(
        "cutoff_len={} max_rows={} pad_id={} adapters={}",
        run.cutoff_len,
        run.max_rows,
        run.pad_id,
        run.lora.len()
    )];
    for adapter in &run.lora {
        let kind = if adapter.is_mixture() {
            format!(
                "mixture experts={} top_k={} policy={:?}",
                adapter.num_experts, adapter.top_k, adapter.routing_policy
            )
        } else {
            "lora".to_string()
        };
        lines.push(format!(
            "{}: {kind} rank={} alpha={} scaling={:.4} padding={:?} micro_batch={}",
            adapter.name,
            adapter.rank,
            adapter.alpha,
            adapter.scaling(),
            adapter.padding_side,
            adapter.micro_batch_size
        ));
    }
    lines
}
