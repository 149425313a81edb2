// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Three subcommands, one per orchestrator entry point:
//
//   start     --config-file run.yml
//   finetune  --config-file finetune.yml
//   evaluate  --run-dir runs/<name> --period test [--epoch 30]

use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::domain::run::Period;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a new model from a full configuration
    Start(StartArgs),

    /// Finetune a trained run with a partial override configuration
    Finetune(FinetuneArgs),

    /// Score a run's checkpoint on one period
    Evaluate(EvaluateArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// YAML configuration of the run
    #[arg(long)]
    pub config_file: PathBuf,

    /// Directory under which new run directories are created
    #[arg(long, default_value = "runs")]
    pub runs_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct FinetuneArgs {
    /// YAML overrides; must set base_run_dir and finetune_modules
    #[arg(long)]
    pub config_file: PathBuf,

    /// Directory under which new run directories are created
    #[arg(long, default_value = "runs")]
    pub runs_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct EvaluateArgs {
    /// Run directory to evaluate
    #[arg(long)]
    pub run_dir: PathBuf,

    /// train, validation or test
    #[arg(long, default_value = "test")]
    pub period: Period,

    /// Checkpoint epoch; the latest when omitted
    #[arg(long)]
    pub epoch: Option<usize>,
}
