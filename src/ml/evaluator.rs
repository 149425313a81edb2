// ============================================================
// Layer 5 — Metric Engine
// ============================================================
// Runs a restored model over every basin of a period and scores
// the de-normalised predictions against observations:
//
//   NSE  = 1 - Σ(sim - obs)² / Σ(obs - mean(obs))²
//   RMSE = sqrt(mean((sim - obs)²))
//   KGE  = 1 - sqrt((r - 1)² + (α - 1)² + (β - 1)²)
//          r = Pearson correlation, α = σ_sim / σ_obs, β = μ_sim / μ_obs
//
// A basin without samples, or with a degenerate observation
// series, scores NaN rather than failing the whole evaluation.
//
// Reference: Nash & Sutcliffe (1970), Gupta et al. (2009)

use std::collections::BTreeMap;

use anyhow::Result;
use burn::data::dataloader::batcher::Batcher;

use crate::data::{batcher::HydroBatcher, dataset::BasinDataset, scaler::FeatureScaler};
use crate::domain::config::Metric;
use crate::infra::metrics::BasinResults;
use crate::ml::model::HydroModel;
use crate::ml::InferBackend;

/// Scores a model per basin.
pub trait MetricEngine {
    fn evaluate(
        &self,
        model:   &HydroModel<InferBackend>,
        dataset: &BasinDataset,
        scaler:  &FeatureScaler,
        metrics: &[Metric],
    ) -> Result<BasinResults>;
}

// ─── Metric functions ────────────────────────────────────────────────────────

fn mean(x: &[f64]) -> f64 {
    x.iter().sum::<f64>() / x.len() as f64
}

fn std_dev(x: &[f64], mu: f64) -> f64 {
    (x.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / x.len() as f64).sqrt()
}

pub fn nse(obs: &[f64], sim: &[f64]) -> f64 {
    if obs.is_empty() {
        return f64::NAN;
    }
    let mu  = mean(obs);
    let num: f64 = obs.iter().zip(sim).map(|(o, s)| (s - o).powi(2)).sum();
    let den: f64 = obs.iter().map(|o| (o - mu).powi(2)).sum();
    if den == 0.0 { f64::NAN } else { 1.0 - num / den }
}

pub fn rmse(obs: &[f64], sim: &[f64]) -> f64 {
    if obs.is_empty() {
        return f64::NAN;
    }
    let mse = obs.iter().zip(sim).map(|(o, s)| (s - o).powi(2)).sum::<f64>() / obs.len() as f64;
    mse.sqrt()
}

pub fn kge(obs: &[f64], sim: &[f64]) -> f64 {
    if obs.is_empty() {
        return f64::NAN;
    }
    let (mu_o, mu_s) = (mean(obs), mean(sim));
    let (sd_o, sd_s) = (std_dev(obs, mu_o), std_dev(sim, mu_s));
    if sd_o == 0.0 || sd_s == 0.0 || mu_o == 0.0 {
        return f64::NAN;
    }
    let cov = obs.iter().zip(sim).map(|(o, s)| (o - mu_o) * (s - mu_s)).sum::<f64>() / obs.len() as f64;
    let r     = cov / (sd_o * sd_s);
    let alpha = sd_s / sd_o;
    let beta  = mu_s / mu_o;
    1.0 - ((r - 1.0).powi(2) + (alpha - 1.0).powi(2) + (beta - 1.0).powi(2)).sqrt()
}

pub fn score(metric: Metric, obs: &[f64], sim: &[f64]) -> f64 {
    match metric {
        Metric::Nse  => nse(obs, sim),
        Metric::Rmse => rmse(obs, sim),
        Metric::Kge  => kge(obs, sim),
    }
}

// ─── BasinMetricEngine ───────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct BasinMetricEngine {
    batch_size: usize,
}

impl Default for BasinMetricEngine {
    fn default() -> Self {
        Self { batch_size: 256 }
    }
}

impl BasinMetricEngine {
    /// De-normalised (observed, simulated) series per target for one basin.
    fn simulate(
        &self,
        model:   &HydroModel<InferBackend>,
        dataset: &BasinDataset,
        basin:   &str,
        scaler:  &FeatureScaler,
    ) -> Result<Vec<(Vec<f64>, Vec<f64>)>> {
        let targets = dataset.targets();
        let batcher = HydroBatcher::<InferBackend>::new(Default::default(), dataset.layout());
        let samples: Vec<_> = dataset.basin_samples(basin).cloned().collect();

        let mut series = vec![(Vec::new(), Vec::new()); targets.len()];
        for chunk in samples.chunks(self.batch_size) {
            let batch = batcher.batch(chunk.to_vec());
            let pred  = model.forward(batch.x_dynamic, batch.x_static);
            let pred: Vec<f32> = pred
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| anyhow::anyhow!("Cannot read predictions: {e:?}"))?;

            for (row, sample) in chunk.iter().enumerate() {
                for (t, name) in targets.iter().enumerate() {
                    let obs = scaler.denormalize(name, sample.target[t])?;
                    let sim = scaler.denormalize(name, pred[row * targets.len() + t])?;
                    series[t].0.push(obs as f64);
                    series[t].1.push(sim as f64);
                }
            }
        }
        Ok(series)
    }
}

impl MetricEngine for BasinMetricEngine {
    fn evaluate(
        &self,
        model:   &HydroModel<InferBackend>,
        dataset: &BasinDataset,
        scaler:  &FeatureScaler,
        metrics: &[Metric],
    ) -> Result<BasinResults> {
        let targets = dataset.targets();
        let mut results = BasinResults::new();

        for basin in dataset.basins() {
            let series = self.simulate(model, dataset, basin, scaler)?;
            let mut row = BTreeMap::new();
            for metric in metrics {
                for (t, name) in targets.iter().enumerate() {
                    let column = if targets.len() > 1 {
                        format!("{}_{}", metric.name(), name)
                    } else {
                        metric.name().to_string()
                    };
                    let (obs, sim) = &series[t];
                    row.insert(column, score(*metric, obs, sim));
                }
            }
            tracing::debug!("Basin {}: {:?}", basin, row);
            results.insert(basin.clone(), row);
        }

        tracing::info!("Evaluated {} basins on {} metrics", results.len(), metrics.len());
        Ok(results)
    }
}
