// ============================================================
// Layer 3 — Configuration Record
// ============================================================
// An ordered YAML mapping from parameter name to value. Unknown
// keys are carried through untouched; the well-known ones get
// typed accessors below. A record is never mutated in place:
// `with` / `without` return a new record.
//
// Example (config.yml):
//   experiment_name: camels_lstm
//   model: cudalstm
//   hidden_size: 64
//   dynamic_inputs: [prcp, tmax, srad]
//   target_variables: [qobs]
//   learning_rate: {0: 1.0e-3, 10: 5.0e-4}

use std::{collections::BTreeMap, fmt, fs, path::{Path, PathBuf}, str::FromStr};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::domain::architecture::Architecture;
use crate::domain::error::{FinetuneError, Result};
use crate::domain::run::Period;

/// Well-known configuration keys.
pub mod keys {
    pub const EXPERIMENT_NAME:   &str = "experiment_name";
    pub const MODEL:             &str = "model";
    pub const HIDDEN_SIZE:       &str = "hidden_size";
    pub const DYNAMIC_INPUTS:    &str = "dynamic_inputs";
    pub const STATIC_ATTRIBUTES: &str = "static_attributes";
    pub const TARGET_VARIABLES:  &str = "target_variables";
    pub const OUTPUT_DROPOUT:    &str = "output_dropout";
    pub const SEQ_LENGTH:        &str = "seq_length";
    pub const EPOCHS:            &str = "epochs";
    pub const BATCH_SIZE:        &str = "batch_size";
    pub const LEARNING_RATE:     &str = "learning_rate";
    pub const VALIDATE_EVERY:    &str = "validate_every";
    pub const METRICS:           &str = "metrics";
    pub const SEED:              &str = "seed";
    pub const DATA_DIR:          &str = "data_dir";
    pub const RUN_DIR:           &str = "run_dir";
    pub const IS_FINETUNING:     &str = "is_finetuning";
    pub const BASE_RUN_DIR:      &str = "base_run_dir";
    pub const FINETUNE_MODULES:  &str = "finetune_modules";
}

const DATE_FORMAT: &str = "%d/%m/%Y";
const DEFAULT_BATCH_SIZE: usize = 256;

// ─── Metric ──────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Metric {
    Nse,
    Rmse,
    Kge,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Nse  => "NSE",
            Metric::Rmse => "RMSE",
            Metric::Kge  => "KGE",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = FinetuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NSE"  => Ok(Metric::Nse),
            "RMSE" => Ok(Metric::Rmse),
            "KGE"  => Ok(Metric::Kge),
            other  => Err(FinetuneError::invalid(keys::METRICS, format!("unknown metric '{other}'"))),
        }
    }
}

// ─── LearningRateSchedule ────────────────────────────────────────────────────
/// Piecewise-constant learning rate keyed by the first epoch it applies to.
#[derive(Debug, Clone, PartialEq)]
pub struct LearningRateSchedule {
    steps: BTreeMap<usize, f64>,
}

impl LearningRateSchedule {
    pub fn constant(rate: f64) -> Self {
        Self { steps: BTreeMap::from([(0, rate)]) }
    }

    pub fn from_steps(steps: BTreeMap<usize, f64>) -> Result<Self> {
        if steps.is_empty() {
            return Err(FinetuneError::invalid(keys::LEARNING_RATE, "schedule has no entries"));
        }
        if let Some((epoch, rate)) = steps.iter().find(|(_, r)| !r.is_finite() || **r < 0.0) {
            return Err(FinetuneError::invalid(
                keys::LEARNING_RATE,
                format!("rate {rate} at epoch {epoch} is not a non-negative number"),
            ));
        }
        Ok(Self { steps })
    }

    /// Rate of the greatest step `<= epoch`, or the first step if none is.
    pub fn rate_for(&self, epoch: usize) -> f64 {
        self.steps
            .range(..=epoch)
            .next_back()
            .or_else(|| self.steps.iter().next())
            .map(|(_, rate)| *rate)
            .unwrap_or(0.0)
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .map(Self::constant)
                .ok_or_else(|| FinetuneError::invalid(keys::LEARNING_RATE, "not a number")),
            Value::Mapping(m) => {
                let mut steps = BTreeMap::new();
                for (k, v) in m {
                    let epoch = match k {
                        Value::Number(n) => n.as_u64().map(|e| e as usize),
                        Value::String(s) => s.trim().parse::<usize>().ok(),
                        _ => None,
                    }
                    .ok_or_else(|| {
                        FinetuneError::invalid(keys::LEARNING_RATE, format!("bad epoch key {k:?}"))
                    })?;
                    let rate = v.as_f64().ok_or_else(|| {
                        FinetuneError::invalid(keys::LEARNING_RATE, format!("bad rate for epoch {epoch}"))
                    })?;
                    steps.insert(epoch, rate);
                }
                Self::from_steps(steps)
            }
            _ => Err(FinetuneError::invalid(
                keys::LEARNING_RATE,
                "expected a number or an {epoch: rate} mapping",
            )),
        }
    }
}

// ─── Config ──────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config {
    entries: Mapping,
}

impl Config {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        match serde_yaml::from_str::<Value>(s)? {
            Value::Mapping(entries) => Ok(Self { entries }),
            Value::Null => Ok(Self::default()),
            _ => Err(FinetuneError::invalid("<root>", "configuration must be a mapping")),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| FinetuneError::io(path, e))?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.entries)?)
    }

    pub fn entries(&self) -> &Mapping {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().filter_map(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A copy of this record with `key` set to `value`.
    pub fn with(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(Value::String(key.to_string()), value.into());
        Self { entries }
    }

    /// A copy of this record without `key`.
    pub fn without(&self, key: &str) -> Self {
        let mut entries = self.entries.clone();
        entries.remove(key);
        Self { entries }
    }

    // ── Structural fields ────────────────────────────────────────────────────

    pub fn architecture(&self) -> Result<Architecture> {
        self.required_str(keys::MODEL)?.parse()
    }

    pub fn hidden_size(&self) -> Result<usize> {
        self.positive_usize(keys::HIDDEN_SIZE)
    }

    pub fn dynamic_inputs(&self) -> Result<Vec<String>> {
        self.non_empty_list(keys::DYNAMIC_INPUTS)
    }

    pub fn static_attributes(&self) -> Result<Vec<String>> {
        Ok(self.string_list(keys::STATIC_ATTRIBUTES)?.unwrap_or_default())
    }

    pub fn target_variables(&self) -> Result<Vec<String>> {
        self.non_empty_list(keys::TARGET_VARIABLES)
    }

    pub fn output_dropout(&self) -> Result<f64> {
        let p = self.optional_f64(keys::OUTPUT_DROPOUT)?.unwrap_or(0.0);
        if !(0.0..1.0).contains(&p) {
            return Err(FinetuneError::invalid(keys::OUTPUT_DROPOUT, "must be in [0, 1)"));
        }
        Ok(p)
    }

    // ── Training fields ──────────────────────────────────────────────────────

    pub fn seq_length(&self) -> Result<usize> {
        self.positive_usize(keys::SEQ_LENGTH)
    }

    pub fn epochs(&self) -> Result<usize> {
        self.optional_usize(keys::EPOCHS)?
            .ok_or_else(|| FinetuneError::missing(keys::EPOCHS))
    }

    pub fn batch_size(&self) -> Result<usize> {
        match self.optional_usize(keys::BATCH_SIZE)? {
            Some(0) => Err(FinetuneError::invalid(keys::BATCH_SIZE, "must be positive")),
            Some(n) => Ok(n),
            None => Ok(DEFAULT_BATCH_SIZE),
        }
    }

    pub fn learning_rate(&self) -> Result<LearningRateSchedule> {
        let value = self
            .get(keys::LEARNING_RATE)
            .ok_or_else(|| FinetuneError::missing(keys::LEARNING_RATE))?;
        LearningRateSchedule::from_value(value)
    }

    pub fn validate_every(&self) -> Result<Option<usize>> {
        Ok(self.optional_usize(keys::VALIDATE_EVERY)?.filter(|n| *n > 0))
    }

    pub fn metrics(&self) -> Result<Vec<Metric>> {
        match self.string_list(keys::METRICS)? {
            Some(names) if !names.is_empty() => names.iter().map(|n| n.parse()).collect(),
            _ => Ok(vec![Metric::Nse]),
        }
    }

    pub fn seed(&self) -> Result<Option<u64>> {
        Ok(self.optional_usize(keys::SEED)?.map(|s| s as u64))
    }

    // ── Data selection ───────────────────────────────────────────────────────

    pub fn data_dir(&self) -> Result<PathBuf> {
        self.required_str(keys::DATA_DIR).map(PathBuf::from)
    }

    pub fn basin_file(&self, period: Period) -> Result<PathBuf> {
        self.required_str(&format!("{period}_basin_file")).map(PathBuf::from)
    }

    /// Inclusive (start, end) dates of a period.
    pub fn date_range(&self, period: Period) -> Result<(NaiveDate, NaiveDate)> {
        let start = self.date(&format!("{period}_start_date"))?;
        let end   = self.date(&format!("{period}_end_date"))?;
        if end < start {
            return Err(FinetuneError::invalid(
                format!("{period}_end_date"),
                format!("{end} is before {start}"),
            ));
        }
        Ok((start, end))
    }

    pub fn has_period(&self, period: Period) -> bool {
        self.contains(&format!("{period}_basin_file"))
            && self.contains(&format!("{period}_start_date"))
            && self.contains(&format!("{period}_end_date"))
    }

    // ── Run bookkeeping ──────────────────────────────────────────────────────

    pub fn experiment_name(&self) -> String {
        self.get(keys::EXPERIMENT_NAME)
            .and_then(Value::as_str)
            .unwrap_or("run")
            .to_string()
    }

    pub fn run_dir(&self) -> Option<PathBuf> {
        self.get(keys::RUN_DIR).and_then(Value::as_str).map(PathBuf::from)
    }

    pub fn is_finetuning(&self) -> bool {
        self.get(keys::IS_FINETUNING).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn base_run_dir(&self) -> Option<PathBuf> {
        self.get(keys::BASE_RUN_DIR).and_then(Value::as_str).map(PathBuf::from)
    }

    pub fn finetune_modules(&self) -> Result<Vec<String>> {
        self.string_list(keys::FINETUNE_MODULES)?
            .ok_or_else(|| FinetuneError::missing(keys::FINETUNE_MODULES))
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn required_str(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            None | Some(Value::Null) => Err(FinetuneError::missing(key)),
            Some(v) => v.as_str().ok_or_else(|| FinetuneError::invalid(key, "expected a string")),
        }
    }

    fn optional_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| FinetuneError::invalid(key, "expected a non-negative integer")),
        }
    }

    fn positive_usize(&self, key: &str) -> Result<usize> {
        match self.optional_usize(key)? {
            None => Err(FinetuneError::missing(key)),
            Some(0) => Err(FinetuneError::invalid(key, "must be positive")),
            Some(n) => Ok(n),
        }
    }

    fn optional_f64(&self, key: &str) -> Result<Option<f64>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| FinetuneError::invalid(key, "expected a number")),
        }
    }

    /// `None` when absent; a single string is read as a one-element list.
    fn string_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(vec![s.clone()])),
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| FinetuneError::invalid(key, "expected a list of strings"))
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(_) => Err(FinetuneError::invalid(key, "expected a list of strings")),
        }
    }

    fn non_empty_list(&self, key: &str) -> Result<Vec<String>> {
        match self.string_list(key)? {
            None => Err(FinetuneError::missing(key)),
            Some(list) if list.is_empty() => Err(FinetuneError::invalid(key, "must not be empty")),
            Some(list) => Ok(list),
        }
    }

    fn date(&self, key: &str) -> Result<NaiveDate> {
        let raw = self.required_str(key)?;
        NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .map_err(|e| FinetuneError::invalid(key, format!("'{raw}' is not dd/mm/YYYY: {e}")))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
experiment_name: camels
model: cudalstm
hidden_size: 64
dynamic_inputs: [prcp, tmax]
static_attributes: [area]
target_variables: qobs
seq_length: 30
epochs: 5
learning_rate:
  0: 0.01
  3: 0.005
train_basin_file: basins.txt
train_start_date: 01/10/1999
train_end_date: 30/09/2008
"#;

    #[test]
    fn test_typed_accessors() {
        let cfg = Config::from_yaml_str(YAML).unwrap();
        assert_eq!(cfg.architecture().unwrap(), Architecture::CudaLstm);
        assert_eq!(cfg.hidden_size().unwrap(), 64);
        assert_eq!(cfg.dynamic_inputs().unwrap(), ["prcp", "tmax"]);
        assert_eq!(cfg.target_variables().unwrap(), ["qobs"]);
        assert_eq!(cfg.batch_size().unwrap(), DEFAULT_BATCH_SIZE);
        assert_eq!(cfg.metrics().unwrap(), [Metric::Nse]);
        assert!(!cfg.is_finetuning());
        assert!(cfg.has_period(Period::Train));
        assert!(!cfg.has_period(Period::Test));
    }

    #[test]
    fn test_dates_are_day_first() {
        let cfg = Config::from_yaml_str(YAML).unwrap();
        let (start, end) = cfg.date_range(Period::Train).unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(1999, 10, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2008, 9, 30).unwrap());
    }

    #[test]
    fn test_learning_rate_schedule_is_piecewise_constant() {
        let cfg = Config::from_yaml_str(YAML).unwrap();
        let lr  = cfg.learning_rate().unwrap();
        assert_eq!(lr.rate_for(1), 0.01);
        assert_eq!(lr.rate_for(2), 0.01);
        assert_eq!(lr.rate_for(3), 0.005);
        assert_eq!(lr.rate_for(100), 0.005);
    }

    #[test]
    fn test_schedule_before_first_key_uses_first_rate() {
        let lr = LearningRateSchedule::from_steps(BTreeMap::from([(5, 0.1), (8, 0.2)])).unwrap();
        assert_eq!(lr.rate_for(1), 0.1);
        assert_eq!(lr.rate_for(9), 0.2);
    }

    #[test]
    fn test_scalar_learning_rate() {
        let cfg = Config::default().with(keys::LEARNING_RATE, 0.001);
        assert_eq!(cfg.learning_rate().unwrap().rate_for(42), 0.001);
    }

    #[test]
    fn test_with_returns_a_new_record() {
        let a = Config::from_yaml_str(YAML).unwrap();
        let b = a.with(keys::HIDDEN_SIZE, 128u64);
        assert_eq!(a.hidden_size().unwrap(), 64);
        assert_eq!(b.hidden_size().unwrap(), 128);
    }

    #[test]
    fn test_missing_and_invalid_fields() {
        let cfg = Config::from_yaml_str("model: cudalstm\nhidden_size: -3").unwrap();
        assert!(matches!(
            cfg.dynamic_inputs(),
            Err(FinetuneError::MissingRequiredField { ref field }) if field == keys::DYNAMIC_INPUTS
        ));
        assert!(matches!(cfg.hidden_size(), Err(FinetuneError::InvalidField { .. })));
    }

    #[test]
    fn test_yaml_round_trip_preserves_key_order() {
        let cfg  = Config::from_yaml_str(YAML).unwrap();
        let back = Config::from_yaml_str(&cfg.to_yaml_string().unwrap()).unwrap();
        assert_eq!(cfg, back);
        assert_eq!(back.keys().next(), Some(keys::EXPERIMENT_NAME));
    }
}
