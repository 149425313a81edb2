// ============================================================
// Layer 3 — Error Taxonomy
// ============================================================
// Every failure the finetuning core can report. None of these
// are retried: each one is a configuration mistake or a broken
// internal invariant, and each carries the offending field or
// value so the caller can fix the configuration.

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::run::RunState;

#[derive(Error, Debug)]
pub enum FinetuneError {
    // ── Configuration ────────────────────────────────────────────────────────
    #[error("missing required configuration field '{field}'")]
    MissingRequiredField { field: String },

    #[error("finetune override changes immutable field(s): {}", keys.join(", "))]
    ConfigConflict { keys: Vec<String> },

    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("unknown model architecture '{0}'")]
    UnknownArchitecture(String),

    #[error("unknown finetune module '{module}' for '{architecture}' (known: {})", known.join(", "))]
    UnknownModule {
        module: String,
        architecture: String,
        known: Vec<String>,
    },

    // ── Checkpoints / parameter transfer ─────────────────────────────────────
    #[error("no checkpoint found in '{}'", run_dir.display())]
    NoCheckpointFound { run_dir: PathBuf },

    #[error("checkpoint '{}' already exists", path.display())]
    CheckpointExists { path: PathBuf },

    #[error("parameter '{key}' has shape {found:?} in checkpoint, model expects {expected:?}")]
    ParameterShapeMismatch {
        key: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("checkpoint keys do not match model (missing: [{}], unexpected: [{}])", missing.join(", "), unexpected.join(", "))]
    ParameterKeyMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("malformed checkpoint '{}': {reason}", path.display())]
    MalformedCheckpoint { path: PathBuf, reason: String },

    // ── Run lifecycle ────────────────────────────────────────────────────────
    #[error("invalid run state transition: from {from} to {to}")]
    InvalidStateTransition { from: RunState, to: RunState },

    #[error("run '{}' is {state} and cannot be evaluated", run_dir.display())]
    RunNotEvaluable { run_dir: PathBuf, state: RunState },

    #[error("base run '{}' is {state}; only completed runs can be finetuned", run_dir.display())]
    BaseRunNotCompleted { run_dir: PathBuf, state: RunState },

    // ── Wrapped I/O and serialization ────────────────────────────────────────
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

impl FinetuneError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField { field: field.into(), reason: reason.into() }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingRequiredField { field: field.into() }
    }
}

pub type Result<T, E = FinetuneError> = std::result::Result<T, E>;
