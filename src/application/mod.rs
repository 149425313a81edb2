// ============================================================
// Layer 2 — Application
// ============================================================
// Workflow coordination only: the orchestrator tells the data,
// ml and infra layers what to do and in which order, and keeps
// run_status.json in step with what actually happened.

/// start / finetune / evaluate
pub mod orchestrator;
