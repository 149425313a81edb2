// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Parses arguments with clap and hands each subcommand to the
// RunOrchestrator. Nothing here touches models or files beyond
// reading the YAML the user points at.

pub mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use commands::{Commands, EvaluateArgs, FinetuneArgs, StartArgs};

use crate::application::orchestrator::RunOrchestrator;
use crate::domain::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "hydrofine",
    version = "0.1.0",
    about = "Train, finetune and evaluate LSTM rainfall-runoff models."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Dispatch to the matching orchestrator entry point.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Start(args)    => run_start(args),
            Commands::Finetune(args) => run_finetune(args),
            Commands::Evaluate(args) => run_evaluate(args),
        }
    }
}

fn read_config(path: &std::path::Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Cannot load configuration '{}'", path.display()))
}

fn run_start(args: StartArgs) -> Result<()> {
    let config = read_config(&args.config_file)?;
    let run    = RunOrchestrator::new(args.runs_dir).start(&config)?;

    println!("Training complete. Run directory: {}", run.run_dir.display());
    Ok(())
}

fn run_finetune(args: FinetuneArgs) -> Result<()> {
    let overrides = read_config(&args.config_file)?;
    let run       = RunOrchestrator::new(args.runs_dir).finetune(&overrides)?;

    println!("Finetuning complete. Run directory: {}", run.run_dir.display());
    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    // Evaluation never allocates a run, so the runs root is irrelevant here.
    let report = RunOrchestrator::new(".").evaluate(&args.run_dir, args.period, args.epoch)?;

    println!("\n{} results (epoch {}) → {}", report.period, report.epoch, report.path.display());
    for (basin, values) in &report.results {
        let cells: Vec<String> = values.iter().map(|(k, v)| format!("{k}={v:.4}")).collect();
        println!("  {basin}: {}", cells.join("  "));
    }
    Ok(())
}
