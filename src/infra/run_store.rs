// ============================================================
// Layer 6 — Run Store
// ============================================================
// Everything a run directory holds besides checkpoints and
// tables:
//
//   <run_dir>/
//     config.yml        resolved configuration, written once
//     run_status.json   {"state": "...", "updated": "...", "error": ...}
//
// plus the default RunLocator, which names new run directories
// `<experiment_name>_<ddmm_HHMMSS>` under a runs root.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::domain::config::Config;
use crate::domain::error::{FinetuneError, Result};
use crate::domain::run::RunState;
use crate::domain::traits::RunLocator;

pub const CONFIG_FILE: &str = "config.yml";
pub const STATUS_FILE: &str = "run_status.json";

// ─── Configuration record ────────────────────────────────────────────────────

/// Persist the resolved record. A run's config.yml is never rewritten.
pub fn persist_config(run_dir: &Path, config: &Config) -> Result<PathBuf> {
    let path = run_dir.join(CONFIG_FILE);
    let yaml = config.to_yaml_string()?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| FinetuneError::io(&path, e))?;
    file.write_all(yaml.as_bytes()).map_err(|e| FinetuneError::io(&path, e))?;
    tracing::debug!("Saved run configuration to '{}'", path.display());
    Ok(path)
}

pub fn load_config(run_dir: &Path) -> Result<Config> {
    Config::from_file(&run_dir.join(CONFIG_FILE))
}

// ─── Run status ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub state:   RunState,
    pub updated: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error:   Option<String>,
}

pub fn read_state(run_dir: &Path) -> Result<RunState> {
    Ok(read_status(run_dir)?.state)
}

pub fn read_status(run_dir: &Path) -> Result<RunStatus> {
    let path = run_dir.join(STATUS_FILE);
    let json = fs::read_to_string(&path).map_err(|e| FinetuneError::io(&path, e))?;
    Ok(serde_json::from_str(&json)?)
}

/// Record the first state of a freshly allocated run.
pub fn init_state(run_dir: &Path) -> Result<()> {
    write_status(run_dir, RunState::Created, None)
}

/// Move the run to `next`, rejecting transitions the state machine forbids.
pub fn advance_state(run_dir: &Path, next: RunState) -> Result<RunState> {
    let state = read_state(run_dir)?.transition(next)?;
    write_status(run_dir, state, None)?;
    tracing::info!("Run '{}' is now {}", run_dir.display(), state);
    Ok(state)
}

/// Mark the run failed, keeping the reason. Already-terminal runs are left alone.
pub fn mark_failed(run_dir: &Path, reason: &str) -> Result<()> {
    let current = read_state(run_dir).unwrap_or(RunState::Created);
    if current.is_terminal() {
        return Ok(());
    }
    write_status(run_dir, RunState::Failed, Some(reason.to_string()))?;
    tracing::error!("Run '{}' failed: {}", run_dir.display(), reason);
    Ok(())
}

fn write_status(run_dir: &Path, state: RunState, error: Option<String>) -> Result<()> {
    let path   = run_dir.join(STATUS_FILE);
    let status = RunStatus { state, updated: Local::now(), error };
    let json   = serde_json::to_string_pretty(&status)?;
    fs::write(&path, json).map_err(|e| FinetuneError::io(&path, e))
}

// ─── TimestampLocator ────────────────────────────────────────────────────────
/// Allocates `<root>/<experiment_name>_<ddmm_HHMMSS>`, adding `_2`, `_3`, ...
/// when that name is already taken.
#[derive(Debug, Clone)]
pub struct TimestampLocator {
    root: PathBuf,
}

impl TimestampLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl RunLocator for TimestampLocator {
    fn allocate(&self, config: &Config) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Cannot create runs directory '{}'", self.root.display()))?;

        let stem = format!("{}_{}", config.experiment_name(), Local::now().format("%d%m_%H%M%S"));
        let mut attempt = 1usize;
        loop {
            let name = if attempt == 1 { stem.clone() } else { format!("{stem}_{attempt}") };
            let dir  = self.root.join(name);
            // create_dir fails if the directory exists, so a name is never handed out twice.
            match fs::create_dir(&dir) {
                Ok(()) => {
                    tracing::info!("Allocated run directory '{}'", dir.display());
                    return Ok(dir);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => {
                    return Err(e).with_context(|| format!("Cannot create run directory '{}'", dir.display()));
                }
            }
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_never_reuses_a_directory() {
        let root    = tempfile::tempdir().unwrap();
        let locator = TimestampLocator::new(root.path());
        let config  = Config::from_yaml_str("experiment_name: camels").unwrap();

        let a = locator.allocate(&config).unwrap();
        let b = locator.allocate(&config).unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());
        assert!(a.file_name().unwrap().to_str().unwrap().starts_with("camels_"));
    }

    #[test]
    fn test_config_is_written_once() {
        let dir    = tempfile::tempdir().unwrap();
        let config = Config::from_yaml_str("model: cudalstm\nhidden_size: 8").unwrap();
        persist_config(dir.path(), &config).unwrap();
        assert_eq!(load_config(dir.path()).unwrap(), config);
        assert!(persist_config(dir.path(), &config.with("hidden_size", 16u64)).is_err());
        assert_eq!(load_config(dir.path()).unwrap().hidden_size().unwrap(), 8);
    }

    #[test]
    fn test_state_machine_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        init_state(dir.path()).unwrap();
        assert!(matches!(
            advance_state(dir.path(), RunState::Training),
            Err(FinetuneError::InvalidStateTransition { .. })
        ));
        advance_state(dir.path(), RunState::Configuring).unwrap();
        advance_state(dir.path(), RunState::Training).unwrap();
        advance_state(dir.path(), RunState::Completed).unwrap();
        assert_eq!(read_state(dir.path()).unwrap(), RunState::Completed);
    }

    #[test]
    fn test_failure_is_recorded_and_final() {
        let dir = tempfile::tempdir().unwrap();
        init_state(dir.path()).unwrap();
        advance_state(dir.path(), RunState::Configuring).unwrap();
        mark_failed(dir.path(), "loss became NaN").unwrap();

        let status = read_status(dir.path()).unwrap();
        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.error.as_deref(), Some("loss became NaN"));
        assert!(advance_state(dir.path(), RunState::Completed).is_err());
    }
}
