// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// File-level persistence of a run directory:
//
//   checkpoint.rs — per-epoch parameter snapshots (safetensors),
//                   latest / by-epoch lookup, no overwrites
//
//   run_store.rs  — config.yml, run_status.json and the default
//                   run-directory allocator
//
//   metrics.rs    — metrics.csv epoch log and per-period
//                   result tables
//
// The feature scaler file lives with the data layer that
// produces it (data::scaler).

/// Safetensors checkpoint saving and loading
pub mod checkpoint;

/// Run configuration, state file and directory allocation
pub mod run_store;

/// Training metrics and evaluation result CSVs
pub mod metrics;
