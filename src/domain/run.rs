// ============================================================
// Layer 3 — Runs, Periods and Checkpoint Identity
// ============================================================
// A run owns a directory, a resolved configuration and the
// checkpoints its training loop produced. Finetune runs point
// back at their base run but never write into it.

use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::domain::config::Config;
use crate::domain::error::{FinetuneError, Result};

// ─── Period ──────────────────────────────────────────────────────────────────
/// Which slice of the data a dataset or evaluation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Train,
    Validation,
    Test,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Train      => "train",
            Period::Validation => "validation",
            Period::Test       => "test",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = FinetuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "train"                => Ok(Period::Train),
            "validation" | "valid" => Ok(Period::Validation),
            "test"                 => Ok(Period::Test),
            other => Err(FinetuneError::invalid(
                "period",
                format!("'{other}' is not one of train, validation, test"),
            )),
        }
    }
}

// ─── RunState ────────────────────────────────────────────────────────────────
/// Lifecycle of a single run:
///   created → configuring → training → {completed | failed}
/// Any non-terminal state may also go straight to failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Created,
    Configuring,
    Training,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Created, Configuring) | (Configuring, Training) | (Training, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn transition(self, next: RunState) -> Result<RunState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(FinetuneError::InvalidStateTransition { from: self, to: next })
        }
    }

    /// Evaluation reads checkpoints, so the run must have produced some.
    pub fn is_evaluable(&self) -> bool {
        matches!(self, RunState::Training | RunState::Completed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Created     => "created",
            RunState::Configuring => "configuring",
            RunState::Training    => "training",
            RunState::Completed   => "completed",
            RunState::Failed      => "failed",
        };
        f.write_str(s)
    }
}

// ─── Checkpoint ──────────────────────────────────────────────────────────────
/// Identity of one stored parameter snapshot: (run directory, epoch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub run_dir: PathBuf,
    pub epoch:   usize,
    pub path:    PathBuf,
}

// ─── RunDescriptor ───────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunKind {
    Base,
    /// Holds the base run location only to find the checkpoint to transfer from.
    Finetune { base_run_dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct RunDescriptor {
    pub kind:        RunKind,
    pub run_dir:     PathBuf,
    pub config:      Config,
    pub checkpoints: Vec<Checkpoint>,
}

impl RunDescriptor {
    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.iter().max_by_key(|c| c.epoch)
    }
}
