// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// All Burn-specific code except the batcher lives here.
//
//   model.rs        — cudalstm / ealstm modules, key-based
//                     parameter export and import
//   snapshot.rs     — backend-free parameter values by key
//   trainability.rs — finetune_modules → per-parameter mask
//   transfer.rs     — fresh model, or base checkpoint + mask
//   trainer.rs      — TrainingLoop trait and the Adam/MSE loop
//   evaluator.rs    — MetricEngine trait, NSE / RMSE / KGE
//
// Training runs on Autodiff<NdArray>; validation and evaluation
// on the inner NdArray backend via `model.valid()`.

/// Backend with gradients, used by the training loop
pub type TrainBackend = burn::backend::Autodiff<burn::backend::NdArray>;

/// Plain backend for validation and evaluation
pub type InferBackend = burn::backend::NdArray;

pub mod model;
pub mod snapshot;
pub mod trainability;
pub mod transfer;
pub mod trainer;
pub mod evaluator;
