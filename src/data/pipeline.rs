// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Turns a configuration and a period into a BasinDataset:
//
//   basin file ──► basin ids
//   time_series/<basin>.csv ──► dated columns ──► period slice
//   attributes.csv ──► static vector per basin
//   FeatureScaler ──► normalised windows of seq_length days
//
// A window ending on day t covers [t - seq_length + 1 ..= t],
// all inside the period. Windows with any missing input, static
// or target are dropped, and so are windows spanning a gap in the
// series' dates.

use std::path::Path;

use crate::data::{
    dataset::{BasinDataset, HydroSample, SampleLayout},
    loader::{read_attributes, read_basin_list, read_time_series, AttributeTable, TimeSeries},
    scaler::FeatureScaler,
};
use crate::domain::config::Config;
use crate::domain::error::{FinetuneError, Result};
use crate::domain::run::Period;

/// Builds datasets scoped to one period of a configuration.
///
/// Implementations:
///   - CsvDataPipeline → `<data_dir>/time_series/*.csv` + `attributes.csv`
pub trait DataPipeline {
    /// Fit normalisation statistics on the training period.
    fn fit_scaler(&self, config: &Config) -> Result<FeatureScaler>;

    fn build(&self, config: &Config, period: Period, scaler: &FeatureScaler) -> Result<BasinDataset>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvDataPipeline;

impl CsvDataPipeline {
    pub fn new() -> Self {
        Self
    }
}

struct Variables {
    dynamic: Vec<String>,
    statics: Vec<String>,
    targets: Vec<String>,
}

impl Variables {
    fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            dynamic: config.dynamic_inputs()?,
            statics: config.static_attributes()?,
            targets: config.target_variables()?,
        })
    }
}

fn column<'a>(series: &'a TimeSeries, basin: &str, name: &str) -> Result<&'a [f32]> {
    series.column(name).ok_or_else(|| {
        FinetuneError::invalid(name, format!("column missing from time series of basin {basin}"))
    })
}

fn static_row(attributes: &AttributeTable, basin: &str, names: &[String]) -> Result<Vec<f32>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let row = attributes
        .get(basin)
        .ok_or_else(|| FinetuneError::invalid(basin, "basin has no row in attributes.csv"))?;
    names
        .iter()
        .map(|n| {
            row.get(n)
                .copied()
                .ok_or_else(|| FinetuneError::invalid(n, "attribute missing from attributes.csv"))
        })
        .collect()
}

impl DataPipeline for CsvDataPipeline {
    fn fit_scaler(&self, config: &Config) -> Result<FeatureScaler> {
        let data_dir = config.data_dir()?;
        let vars     = Variables::from_config(config)?;
        let basins   = read_basin_list(&config.basin_file(Period::Train)?)?;
        let (start, end) = config.date_range(Period::Train)?;

        let mut dynamic: Vec<Vec<f32>> = vec![Vec::new(); vars.dynamic.len() + vars.targets.len()];
        for basin in &basins {
            let series = read_time_series(&data_dir, basin)?;
            let span   = series.date_span(start, end);
            for (i, name) in vars.dynamic.iter().chain(&vars.targets).enumerate() {
                dynamic[i].extend_from_slice(&column(&series, basin, name)?[span.clone()]);
            }
        }

        let mut scaler = FeatureScaler::default();
        for (name, values) in vars.dynamic.iter().chain(&vars.targets).zip(&dynamic) {
            scaler.fit_variable(name, values);
        }

        if !vars.statics.is_empty() {
            let attributes = read_attributes(&data_dir)?;
            for name in &vars.statics {
                let mut values = Vec::with_capacity(basins.len());
                for basin in &basins {
                    values.extend(static_row(&attributes, basin, std::slice::from_ref(name))?);
                }
                scaler.fit_variable(name, &values);
            }
        }

        tracing::info!(
            "Fitted feature scaler on {} basins, {} variables",
            basins.len(),
            scaler.variables.len()
        );
        Ok(scaler)
    }

    fn build(&self, config: &Config, period: Period, scaler: &FeatureScaler) -> Result<BasinDataset> {
        let data_dir   = config.data_dir()?;
        let vars       = Variables::from_config(config)?;
        let seq_length = config.seq_length()?;
        let basins     = read_basin_list(&config.basin_file(period)?)?;
        let (start, end) = config.date_range(period)?;

        let attributes = if vars.statics.is_empty() {
            AttributeTable::new()
        } else {
            read_attributes(&data_dir)?
        };

        let layout = SampleLayout {
            seq_length,
            n_dynamic: vars.dynamic.len(),
            n_static:  vars.statics.len(),
            n_targets: vars.targets.len(),
        };

        let mut samples = Vec::new();
        for basin in &basins {
            let before = samples.len();
            basin_samples(&data_dir, basin, &vars, &attributes, scaler, layout, (start, end), &mut samples)?;
            let added = samples.len() - before;
            if added == 0 {
                tracing::warn!("Basin {} has no complete {}-day window in the {} period", basin, seq_length, period);
            }
        }

        tracing::info!("{} dataset: {} samples from {} basins", period, samples.len(), basins.len());
        Ok(BasinDataset::new(layout, vars.targets, basins, samples))
    }
}

#[allow(clippy::too_many_arguments)]
fn basin_samples(
    data_dir:   &Path,
    basin:      &str,
    vars:       &Variables,
    attributes: &AttributeTable,
    scaler:     &FeatureScaler,
    layout:     SampleLayout,
    (start, end): (chrono::NaiveDate, chrono::NaiveDate),
    out:        &mut Vec<HydroSample>,
) -> Result<()> {
    let series = read_time_series(data_dir, basin)?;
    let span   = series.date_span(start, end);

    let normalised = |names: &[String]| -> Result<Vec<Vec<f32>>> {
        names
            .iter()
            .map(|n| -> Result<Vec<f32>> {
                column(&series, basin, n)?[span.clone()]
                    .iter()
                    .map(|v| scaler.normalize(n, *v))
                    .collect()
            })
            .collect()
    };
    let dynamic = normalised(&vars.dynamic)?;
    let targets = normalised(&vars.targets)?;

    let raw_statics = static_row(attributes, basin, &vars.statics)?;
    let statics: Vec<f32> = vars
        .statics
        .iter()
        .zip(&raw_statics)
        .map(|(n, v)| scaler.normalize(n, *v))
        .collect::<Result<_>>()?;
    if statics.iter().any(|v| !v.is_finite()) {
        return Ok(());
    }

    let days = span.len();
    let dates = &series.dates[span.clone()];
    for t in layout.seq_length.saturating_sub(1)..days {
        let window = t + 1 - layout.seq_length..=t;
        if (dates[t] - dates[*window.start()]).num_days() != layout.seq_length as i64 - 1 {
            continue;
        }

        let mut x = Vec::with_capacity(layout.seq_length * layout.n_dynamic);
        for day in window {
            x.extend(dynamic.iter().map(|col| col[day]));
        }
        let y: Vec<f32> = targets.iter().map(|col| col[t]).collect();

        if x.iter().chain(&y).any(|v| !v.is_finite()) {
            continue;
        }
        out.push(HydroSample {
            basin:   basin.to_string(),
            date:    dates[t],
            dynamic: x,
            statics: statics.clone(),
            target:  y,
        });
    }
    Ok(())
}
