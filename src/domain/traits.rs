// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// Seams the orchestrator is built against. Concrete versions
// live in the data, ml and infra layers; callers may hand the
// orchestrator their own locator, training loop or metric engine.
//
//   RunLocator    — hands out a fresh, unused run directory
//   DataPipeline  — data::pipeline
//   TrainingLoop  — ml::trainer
//   MetricEngine  — ml::evaluator

use std::path::PathBuf;

use anyhow::Result;

use crate::domain::config::Config;

// ─── RunLocator ──────────────────────────────────────────────────────────────
/// Allocates the storage location of a new run.
///
/// Implementations:
///   - TimestampLocator → `<root>/<experiment_name>_<ddmm_HHMMSS>`
///
/// The returned directory must exist, be empty, and never have been
/// handed out before: two runs never share a location.
pub trait RunLocator {
    fn allocate(&self, config: &Config) -> Result<PathBuf>;
}
