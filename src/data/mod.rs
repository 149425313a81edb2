// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything from CSV files on disk to tensor batches:
//
//   basin file + time_series/*.csv + attributes.csv
//       │
//       ▼
//   loader        → dated columns and attribute rows
//       │
//       ▼
//   FeatureScaler → mean/std per variable (train period)
//       │
//       ▼
//   pipeline      → normalised seq_length windows per basin
//       │
//       ▼
//   BasinDataset  → implements Burn's Dataset trait
//       │
//       ▼
//   HydroBatcher  → stacks samples into tensor batches

/// Reads basin lists, per-basin time series and static attributes
pub mod loader;

/// Per-variable normalisation statistics, persisted per run
pub mod scaler;

/// Implements Burn's Dataset trait for input windows
pub mod dataset;

/// Implements Burn's Batcher trait to create tensor batches
pub mod batcher;

/// DataPipeline trait and the CSV implementation
pub mod pipeline;
