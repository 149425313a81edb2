// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types that define what a run, a configuration and
// a finetuning request ARE. No burn types, no file formats
// beyond reading a YAML record.
//
//   config.rs       — the Configuration Record
//   resolver.rs     — base + override → resolved record
//   architecture.rs — per-architecture module declarations
//   run.rs          — run states, periods, checkpoint identity
//   error.rs        — the typed error taxonomy
//   traits.rs       — seams the orchestrator depends on

pub mod architecture;
pub mod config;
pub mod error;
pub mod resolver;
pub mod run;
pub mod traits;
