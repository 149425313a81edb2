// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Two kinds of tables land in a run directory:
//
//   metrics.csv                                  one row per epoch
//     epoch,train_loss,val_loss
//     1,0.912345,0.954321
//     2,0.701234,NaN          ← no validation this epoch
//
//   <period>/model_epoch{NNN}/<period>_metrics.csv   one row per basin
//     basin,NSE,RMSE
//     01013500,0.71,0.42
//
// The epoch log is append-only. A result table is rewritten as a
// whole, so evaluating the same (run, epoch, period) twice leaves
// identical bytes behind.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::run::Period;

/// One row of the per-epoch loss log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,

    /// Mean MSE over all training batches (normalised units)
    pub train_loss: f64,

    /// Mean MSE on the validation period; NaN when not validated this epoch
    pub val_loss: f64,
}

impl EpochMetrics {
    pub fn new(epoch: usize, train_loss: f64, val_loss: f64) -> Self {
        Self { epoch, train_loss, val_loss }
    }

    /// Returns true if this epoch improved over the previous best val_loss
    pub fn is_improvement(&self, best_val_loss: f64) -> bool {
        self.val_loss < best_val_loss
    }
}

/// Appends epoch metrics to `<run_dir>/metrics.csv`.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Writes the CSV header if the file doesn't exist yet.
    pub fn new(run_dir: &Path) -> Result<Self> {
        fs::create_dir_all(run_dir)?;
        let csv_path = run_dir.join("metrics.csv");

        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)?;
            writeln!(f, "epoch,train_loss,val_loss")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    pub fn log(&self, m: &EpochMetrics) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)?;

        writeln!(f, "{},{:.6},{:.6}", m.epoch, m.train_loss, m.val_loss)?;

        tracing::debug!(
            "Logged epoch {} metrics: train_loss={:.4}, val_loss={:.4}",
            m.epoch,
            m.train_loss,
            m.val_loss,
        );
        Ok(())
    }

    pub fn csv_path(&self) -> &PathBuf {
        &self.csv_path
    }
}

/// Per-basin evaluation results: basin → metric column → value.
pub type BasinResults = BTreeMap<String, BTreeMap<String, f64>>;

pub fn results_path(run_dir: &Path, period: Period, epoch: usize) -> PathBuf {
    run_dir
        .join(period.as_str())
        .join(format!("model_epoch{epoch:03}"))
        .join(format!("{period}_metrics.csv"))
}

/// Write the result table of one (run, epoch, period), replacing any
/// earlier table for the same key. Nothing else is touched.
pub fn write_results(run_dir: &Path, period: Period, epoch: usize, results: &BasinResults) -> Result<PathBuf> {
    let path = results_path(run_dir, period, epoch);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create '{}'", parent.display()))?;
    }

    let columns: BTreeSet<&str> = results.values().flat_map(|m| m.keys().map(String::as_str)).collect();

    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("Cannot write results to '{}'", path.display()))?;
    writer.write_record(std::iter::once("basin").chain(columns.iter().copied()))?;
    for (basin, values) in results {
        let mut row = vec![basin.clone()];
        row.extend(columns.iter().map(|c| {
            values.get(*c).map(|v| format!("{v:.6}")).unwrap_or_else(|| "NaN".to_string())
        }));
        writer.write_record(&row)?;
    }
    writer.flush()?;

    tracing::info!("Wrote {} results for {} basins to '{}'", period, results.len(), path.display());
    Ok(path)
}

pub fn read_results(path: &Path) -> Result<BasinResults> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Cannot read results from '{}'", path.display()))?;
    let headers = reader.headers()?.clone();

    let mut results = BasinResults::new();
    for record in reader.records() {
        let record = record?;
        let basin  = record.get(0).unwrap_or_default().to_string();
        let row = headers
            .iter()
            .zip(record.iter())
            .skip(1)
            .map(|(h, v)| (h.to_string(), v.parse::<f64>().unwrap_or(f64::NAN)))
            .collect();
        results.insert(basin, row);
    }
    Ok(results)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_improvement() {
        let m = EpochMetrics::new(2, 0.5, 0.3);
        assert!(m.is_improvement(0.4));
        assert!(!m.is_improvement(0.2));
        // NaN never counts as an improvement
        assert!(!EpochMetrics::new(3, 0.5, f64::NAN).is_improvement(1.0));
    }

    #[test]
    fn test_logger_appends_rows() {
        let dir    = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path()).unwrap();
        logger.log(&EpochMetrics::new(1, 1.0, 0.5)).unwrap();
        logger.log(&EpochMetrics::new(2, 0.25, f64::NAN)).unwrap();

        let text = fs::read_to_string(logger.csv_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, ["epoch,train_loss,val_loss", "1,1.000000,0.500000", "2,0.250000,NaN"]);
    }

    #[test]
    fn test_results_table_location_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let mut results = BasinResults::new();
        results.insert("b2".into(), BTreeMap::from([("NSE".to_string(), 0.5), ("RMSE".to_string(), 1.25)]));
        results.insert("b1".into(), BTreeMap::from([("NSE".to_string(), f64::NAN)]));

        let path = write_results(dir.path(), Period::Test, 4, &results).unwrap();
        assert!(path.ends_with("test/model_epoch004/test_metrics.csv"));
        let first = fs::read(&path).unwrap();

        write_results(dir.path(), Period::Test, 4, &results).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);

        let back = read_results(&path).unwrap();
        assert_eq!(back["b2"]["RMSE"], 1.25);
        assert!(back["b1"]["RMSE"].is_nan());
    }
}
