// ============================================================
// Layer 4 — Basin Data Loader
// ============================================================
// Reads the on-disk dataset layout:
//
//   <data_dir>/
//     time_series/<basin>.csv   date,prcp,tmax,...,qobs
//     attributes.csv            basin,area,elev_mean,...
//
// plus plain-text basin lists (one id per line, '#' comments).
// Missing values (empty cell, "nan", "NaN") load as f32::NAN so
// sample construction can drop the affected windows.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::NaiveDate;

use crate::domain::error::{FinetuneError, Result};

// ─── TimeSeries ──────────────────────────────────────────────────────────────
/// Daily records of one basin, columns keyed by header name.
#[derive(Debug, Clone, Default)]
pub struct TimeSeries {
    pub dates:   Vec<NaiveDate>,
    pub columns: BTreeMap<String, Vec<f32>>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&[f32]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Index range of the rows whose date lies in [start, end].
    pub fn date_span(&self, start: NaiveDate, end: NaiveDate) -> std::ops::Range<usize> {
        let lo = self.dates.partition_point(|d| *d < start);
        let hi = self.dates.partition_point(|d| *d <= end);
        lo..hi.max(lo)
    }
}

/// Static attributes: basin id → attribute name → value.
pub type AttributeTable = BTreeMap<String, BTreeMap<String, f32>>;

// ─── Basin lists ─────────────────────────────────────────────────────────────

pub fn read_basin_list(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|e| FinetuneError::io(path, e))?;
    let basins: Vec<String> = text
        .lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    if basins.is_empty() {
        return Err(FinetuneError::invalid(
            path.display().to_string(),
            "basin file lists no basins",
        ));
    }
    tracing::debug!("Read {} basins from '{}'", basins.len(), path.display());
    Ok(basins)
}

// ─── Time series ─────────────────────────────────────────────────────────────

pub fn time_series_path(data_dir: &Path, basin: &str) -> PathBuf {
    data_dir.join("time_series").join(format!("{basin}.csv"))
}

pub fn read_time_series(data_dir: &Path, basin: &str) -> Result<TimeSeries> {
    let path = time_series_path(data_dir, basin);
    let mut reader = csv::Reader::from_path(&path)?;

    let headers = reader.headers()?.clone();
    let names: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();

    let mut series = TimeSeries::default();
    let mut values: Vec<Vec<f32>> = vec![Vec::new(); names.len()];

    for record in reader.records() {
        let record = record?;
        let raw_date = record.get(0).unwrap_or("").trim();
        let date = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d").map_err(|e| {
            FinetuneError::invalid(path.display().to_string(), format!("bad date '{raw_date}': {e}"))
        })?;
        series.dates.push(date);

        for (i, column) in values.iter_mut().enumerate() {
            column.push(parse_value(record.get(i + 1).unwrap_or("")));
        }
    }

    if !series.dates.windows(2).all(|w| w[0] < w[1]) {
        return Err(FinetuneError::invalid(
            path.display().to_string(),
            "dates must be strictly increasing",
        ));
    }

    series.columns = names.into_iter().zip(values).collect();
    tracing::debug!("Loaded {} days for basin {}", series.len(), basin);
    Ok(series)
}

fn parse_value(cell: &str) -> f32 {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") {
        return f32::NAN;
    }
    cell.parse::<f32>().unwrap_or(f32::NAN)
}

// ─── Attributes ──────────────────────────────────────────────────────────────

pub fn read_attributes(data_dir: &Path) -> Result<AttributeTable> {
    let path = data_dir.join("attributes.csv");
    let mut reader = csv::Reader::from_path(&path)?;

    let headers = reader.headers()?.clone();
    let names: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();

    let mut table = AttributeTable::new();
    for record in reader.records() {
        let record = record?;
        let basin = record.get(0).unwrap_or("").trim().to_string();
        let row = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), parse_value(record.get(i + 1).unwrap_or(""))))
            .collect();
        table.insert(basin, row);
    }
    tracing::debug!("Loaded attributes for {} basins", table.len());
    Ok(table)
}
