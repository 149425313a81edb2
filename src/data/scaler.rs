// ============================================================
// Layer 4 — Feature Scaler
// ============================================================
// Per-variable mean / std fitted once on the training period
// of a base run and stored as train_data/scaler.yml. Finetune
// runs copy that file verbatim, so the model always sees inputs
// normalised exactly as during its original training.

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::domain::error::{FinetuneError, Result};

pub const SCALER_FILE: &str = "train_data/scaler.yml";

const RELATIVE_STD_FLOOR: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub mean: f64,
    pub std:  f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaler {
    pub variables: BTreeMap<String, Moments>,
}

impl FeatureScaler {
    /// Fit one variable from raw values (Welford's online moments).
    /// NaNs are ignored; a constant or empty column gets std 1 so
    /// normalisation stays finite.
    pub fn fit_variable<'a>(&mut self, name: &str, values: impl IntoIterator<Item = &'a f32>) {
        let mut n    = 0usize;
        let mut mean = 0.0f64;
        let mut m2   = 0.0f64;
        for v in values.into_iter().filter(|v| v.is_finite()) {
            let v = *v as f64;
            n += 1;
            let delta = v - mean;
            mean += delta / n as f64;
            m2   += delta * (v - mean);
        }

        let var = if n > 1 { m2 / (n - 1) as f64 } else { 0.0 };
        let std = var.sqrt();
        // Spread below f64 resolution at this magnitude is rounding noise.
        let std = if std > mean.abs() * RELATIVE_STD_FLOOR && std > 0.0 { std } else { 1.0 };

        self.variables.insert(name.to_string(), Moments { mean, std });
    }

    pub fn moments(&self, name: &str) -> Result<Moments> {
        self.variables
            .get(name)
            .copied()
            .ok_or_else(|| FinetuneError::invalid(name, "variable is not covered by the feature scaler"))
    }

    pub fn normalize(&self, name: &str, value: f32) -> Result<f32> {
        let m = self.moments(name)?;
        Ok(((value as f64 - m.mean) / m.std) as f32)
    }

    pub fn denormalize(&self, name: &str, value: f32) -> Result<f32> {
        let m = self.moments(name)?;
        Ok((value as f64 * m.std + m.mean) as f32)
    }

    pub fn save(&self, run_dir: &Path) -> Result<()> {
        let path = run_dir.join(SCALER_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| FinetuneError::io(parent, e))?;
        }
        let yaml = serde_yaml::to_string(self)?;
        fs::write(&path, yaml).map_err(|e| FinetuneError::io(&path, e))?;
        tracing::debug!("Saved feature scaler to '{}'", path.display());
        Ok(())
    }

    pub fn load(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(SCALER_FILE);
        let yaml = fs::read_to_string(&path).map_err(|e| FinetuneError::io(&path, e))?;
        Ok(serde_yaml::from_str(&yaml)?)
    }

    /// Copy a base run's scaler file byte for byte.
    pub fn copy_between(base_run_dir: &Path, run_dir: &Path) -> Result<()> {
        let src = base_run_dir.join(SCALER_FILE);
        let dst = run_dir.join(SCALER_FILE);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| FinetuneError::io(parent, e))?;
        }
        fs::copy(&src, &dst).map_err(|e| FinetuneError::io(&src, e))?;
        tracing::info!("Reusing feature scaler of base run '{}'", base_run_dir.display());
        Ok(())
    }
}
