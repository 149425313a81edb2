// ============================================================
// Layer 2 — Run Orchestrator
// ============================================================
// The three entry points, each a fixed sequence of steps:
//
//   start(config)
//     1. resolve fresh record, validate structure
//     2. allocate run dir, persist config.yml        [created]
//     3. fit + persist scaler, build fresh model     [configuring]
//     4. build datasets, run training loop           [training]
//                                                    [completed]
//   finetune(overrides)
//     1. check the base run completed, load its config.yml,
//        resolve, validate modules
//     2. allocate run dir, persist config.yml        [created]
//     3. copy base scaler, transfer base weights     [configuring]
//     4. build datasets, run masked training loop    [training]
//                                                    [completed]
//   evaluate(run_dir, period, epoch?)
//     restore checkpoint → metric engine → result table
//
// Configuration errors surface before a run directory exists.
// Any error after allocation marks the run failed first.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::data::{
    pipeline::{CsvDataPipeline, DataPipeline},
    scaler::FeatureScaler,
};
use crate::domain::{
    config::{keys, Config},
    error::FinetuneError,
    resolver::{resolve_finetune, resolve_fresh, REQUIRED_OVERRIDE_FIELDS},
    run::{Checkpoint, Period, RunDescriptor, RunKind, RunState},
    traits::RunLocator,
};
use crate::infra::{
    checkpoint::CheckpointStore,
    metrics::{write_results, BasinResults},
    run_store::{self, TimestampLocator},
};
use crate::ml::{
    evaluator::{BasinMetricEngine, MetricEngine},
    model::HydroModelConfig,
    trainability::validate_modules,
    trainer::{BurnTrainer, TrainingLoop, TrainingRequest, TrainingSettings},
    transfer, InferBackend, TrainBackend,
};

/// Outcome of one `evaluate` call.
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub run_dir: PathBuf,
    pub period:  Period,
    pub epoch:   usize,
    pub path:    PathBuf,
    pub results: BasinResults,
}

pub struct RunOrchestrator {
    locator:  Box<dyn RunLocator>,
    pipeline: Box<dyn DataPipeline>,
    trainer:  Box<dyn TrainingLoop>,
    metrics:  Box<dyn MetricEngine>,
    store:    CheckpointStore,
}

impl RunOrchestrator {
    /// Default collaborators; new runs are allocated under `runs_root`.
    pub fn new(runs_root: impl Into<PathBuf>) -> Self {
        let store = CheckpointStore::new();
        Self {
            locator:  Box::new(TimestampLocator::new(runs_root)),
            pipeline: Box::new(CsvDataPipeline::new()),
            trainer:  Box::new(BurnTrainer::new(store)),
            metrics:  Box::new(BasinMetricEngine::default()),
            store,
        }
    }

    pub fn with_locator(mut self, locator: impl RunLocator + 'static) -> Self {
        self.locator = Box::new(locator);
        self
    }

    pub fn with_trainer(mut self, trainer: impl TrainingLoop + 'static) -> Self {
        self.trainer = Box::new(trainer);
        self
    }

    pub fn with_metrics(mut self, metrics: impl MetricEngine + 'static) -> Self {
        self.metrics = Box::new(metrics);
        self
    }

    // ── start ────────────────────────────────────────────────────────────────

    /// Train a new model from scratch.
    pub fn start(&self, config: &Config) -> Result<RunDescriptor> {
        let config = resolve_fresh(config);
        validate_structure(&config)?;

        let run_dir = self.allocate(&config)?;
        let config  = config.with(keys::RUN_DIR, run_dir.to_string_lossy().into_owned());

        self.guarded(&run_dir, || {
            run_store::persist_config(&run_dir, &config)?;
            run_store::advance_state(&run_dir, RunState::Configuring)?;

            let scaler = self.pipeline.fit_scaler(&config)?;
            scaler.save(&run_dir)?;

            let device = Default::default();
            let (model, mask) = transfer::fresh::<TrainBackend>(&config, &device)?;

            let checkpoints = self.train(&config, &run_dir, &scaler, TrainingRequestParts { model, mask })?;
            Ok(RunDescriptor { kind: RunKind::Base, run_dir: run_dir.clone(), config: config.clone(), checkpoints })
        })
    }

    // ── finetune ─────────────────────────────────────────────────────────────

    /// Continue training a base run's latest checkpoint with the modules
    /// named in `finetune_modules` unfrozen. The base run is only read.
    pub fn finetune(&self, overrides: &Config) -> Result<RunDescriptor> {
        for key in REQUIRED_OVERRIDE_FIELDS {
            if overrides.get(key).map_or(true, serde_yaml::Value::is_null) {
                return Err(FinetuneError::missing(*key).into());
            }
        }
        let base_run_dir = overrides
            .base_run_dir()
            .ok_or_else(|| FinetuneError::invalid(keys::BASE_RUN_DIR, "expected a path"))?;

        let base_state = run_store::read_state(&base_run_dir)
            .with_context(|| format!("Cannot read the status of base run '{}'", base_run_dir.display()))?;
        if base_state != RunState::Completed {
            return Err(FinetuneError::BaseRunNotCompleted { run_dir: base_run_dir, state: base_state }.into());
        }

        let base = run_store::load_config(&base_run_dir)
            .with_context(|| format!("Cannot read the configuration of base run '{}'", base_run_dir.display()))?;
        let config = resolve_finetune(&base, overrides)?;
        validate_structure(&config)?;
        validate_modules(config.architecture()?, &config.finetune_modules()?)?;
        self.store.latest(&base_run_dir)?;

        let run_dir = self.allocate(&config)?;
        let config  = config.with(keys::RUN_DIR, run_dir.to_string_lossy().into_owned());

        self.guarded(&run_dir, || {
            run_store::persist_config(&run_dir, &config)?;
            run_store::advance_state(&run_dir, RunState::Configuring)?;

            FeatureScaler::copy_between(&base_run_dir, &run_dir)?;
            let scaler = FeatureScaler::load(&run_dir)?;

            let device = Default::default();
            let (model, mask) = transfer::initialize::<TrainBackend>(&config, &self.store, &device)?;

            let checkpoints = self.train(&config, &run_dir, &scaler, TrainingRequestParts { model, mask })?;
            Ok(RunDescriptor {
                kind:    RunKind::Finetune { base_run_dir: base_run_dir.clone() },
                run_dir: run_dir.clone(),
                config:  config.clone(),
                checkpoints,
            })
        })
    }

    // ── evaluate ─────────────────────────────────────────────────────────────

    /// Score a run's latest (or chosen) checkpoint over one period.
    /// Only `<run>/<period>/model_epoch{NNN}/<period>_metrics.csv` is written.
    pub fn evaluate(&self, run_dir: &Path, period: Period, epoch: Option<usize>) -> Result<EvaluationReport> {
        let state = run_store::read_state(run_dir)?;
        if !state.is_evaluable() {
            return Err(FinetuneError::RunNotEvaluable { run_dir: run_dir.to_path_buf(), state }.into());
        }

        let config = run_store::load_config(run_dir)?;
        let scaler = FeatureScaler::load(run_dir)?;
        let checkpoint = match epoch {
            Some(e) => self.store.at(run_dir, e)?,
            None    => self.store.latest(run_dir)?,
        };

        tracing::info!("Evaluating '{}' epoch {} on the {} period", run_dir.display(), checkpoint.epoch, period);
        let model   = transfer::restore::<InferBackend>(&config, &self.store, &checkpoint, &Default::default())?;
        let dataset = self.pipeline.build(&config, period, &scaler)?;
        let results = self.metrics.evaluate(&model, &dataset, &scaler, &config.metrics()?)?;
        let path    = write_results(run_dir, period, checkpoint.epoch, &results)?;

        Ok(EvaluationReport { run_dir: run_dir.to_path_buf(), period, epoch: checkpoint.epoch, path, results })
    }

    // ── Shared steps ─────────────────────────────────────────────────────────

    fn allocate(&self, config: &Config) -> Result<PathBuf> {
        let run_dir = self.locator.allocate(config)?;
        run_store::init_state(&run_dir)?;
        Ok(run_dir)
    }

    /// Run the post-allocation steps; on error, record the failure in
    /// run_status.json before handing the error back.
    fn guarded<T>(&self, run_dir: &Path, steps: impl FnOnce() -> Result<T>) -> Result<T> {
        steps().inspect_err(|e| {
            if let Err(mark) = run_store::mark_failed(run_dir, &format!("{e:#}")) {
                tracing::error!("Cannot record failure of '{}': {}", run_dir.display(), mark);
            }
        })
    }

    fn train(
        &self,
        config:  &Config,
        run_dir: &Path,
        scaler:  &FeatureScaler,
        parts:   TrainingRequestParts,
    ) -> Result<Vec<Checkpoint>> {
        let train = self.pipeline.build(config, Period::Train, scaler)?;
        let validation = if config.has_period(Period::Validation) {
            Some(self.pipeline.build(config, Period::Validation, scaler)?)
        } else {
            None
        };

        let settings = TrainingSettings {
            mask:           parts.mask,
            train,
            validation,
            schedule:       config.learning_rate()?,
            epochs:         config.epochs()?,
            batch_size:     config.batch_size()?,
            seed:           config.seed()?,
            validate_every: config.validate_every()?,
            run_dir:        run_dir.to_path_buf(),
        };

        run_store::advance_state(run_dir, RunState::Training)?;
        let checkpoints = self.trainer.run(TrainingRequest { model: parts.model, settings })?;
        run_store::advance_state(run_dir, RunState::Completed)?;
        Ok(checkpoints)
    }
}

struct TrainingRequestParts {
    model: crate::ml::model::HydroModel<TrainBackend>,
    mask:  crate::ml::trainability::TrainabilityMask,
}

/// Every check that needs nothing but the record itself.
fn validate_structure(config: &Config) -> Result<(), FinetuneError> {
    HydroModelConfig::from_run_config(config)?;
    config.seq_length()?;
    config.epochs()?;
    config.batch_size()?;
    config.learning_rate()?;
    config.metrics()?;
    config.data_dir()?;
    config.basin_file(Period::Train)?;
    config.date_range(Period::Train)?;
    if config.has_period(Period::Validation) {
        config.date_range(Period::Validation)?;
    }
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, collections::BTreeMap, fs, rc::Rc};

    use serde_yaml::Value;

    use crate::data::dataset::BasinDataset;
    use crate::domain::config::Metric;
    use crate::infra::metrics::read_results;
    use crate::ml::{model::HydroModel, snapshot::ParameterSnapshot};

    struct Fixture {
        _tmp:      tempfile::TempDir,
        data_dir:  PathBuf,
        runs_root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp      = tempfile::tempdir().unwrap();
            let data_dir = tmp.path().join("data");
            fs::create_dir_all(data_dir.join("time_series")).unwrap();

            for (b, basin) in ["b1", "b2"].iter().enumerate() {
                let mut csv = String::from("date,prcp,tmax,qobs\n");
                let start = chrono::NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
                for d in 0..60u64 {
                    let date = start + chrono::Days::new(d);
                    let p    = ((d as f32) * 0.3 + b as f32).sin().abs() * 5.0;
                    let t    = 10.0 + (d as f32 * 0.1).cos();
                    let q    = 0.4 * p + 0.1 * t;
                    csv.push_str(&format!("{},{p:.3},{t:.3},{q:.3}\n", date.format("%Y-%m-%d")));
                }
                fs::write(data_dir.join("time_series").join(format!("{basin}.csv")), csv).unwrap();
            }
            fs::write(data_dir.join("attributes.csv"), "basin,area\nb1,10.0\nb2,25.0\n").unwrap();
            fs::write(data_dir.join("all_basins.txt"), "b1\nb2\n").unwrap();
            fs::write(data_dir.join("one_basin.txt"), "b2\n").unwrap();

            let runs_root = tmp.path().join("runs");
            Self { _tmp: tmp, data_dir, runs_root }
        }

        fn config(&self) -> Config {
            let d = self.data_dir.display();
            Config::from_yaml_str(&format!(
                "experiment_name: test\n\
                 model: cudalstm\n\
                 hidden_size: 4\n\
                 dynamic_inputs: [prcp, tmax]\n\
                 static_attributes: [area]\n\
                 target_variables: [qobs]\n\
                 seq_length: 5\n\
                 epochs: 2\n\
                 batch_size: 16\n\
                 learning_rate: {{1: 0.01, 2: 0.005}}\n\
                 seed: 3\n\
                 validate_every: 1\n\
                 metrics: [NSE, RMSE]\n\
                 data_dir: {d}\n\
                 train_basin_file: {d}/all_basins.txt\n\
                 train_start_date: 01/01/2000\n\
                 train_end_date: 31/01/2000\n\
                 validation_basin_file: {d}/all_basins.txt\n\
                 validation_start_date: 01/02/2000\n\
                 validation_end_date: 29/02/2000\n\
                 test_basin_file: {d}/all_basins.txt\n\
                 test_start_date: 01/02/2000\n\
                 test_end_date: 29/02/2000\n"
            ))
            .unwrap()
        }

        fn overrides(&self, base: &Path, modules: &[&str]) -> Config {
            Config::default()
                .with(keys::BASE_RUN_DIR, base.to_string_lossy().into_owned())
                .with(keys::FINETUNE_MODULES, modules.iter().map(|m| Value::from(*m)).collect::<Vec<_>>())
        }

        fn orchestrator(&self) -> RunOrchestrator {
            RunOrchestrator::new(&self.runs_root)
        }

        fn run_count(&self) -> usize {
            fs::read_dir(&self.runs_root).map(|d| d.count()).unwrap_or(0)
        }
    }

    fn dir_bytes(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut out = BTreeMap::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            for entry in fs::read_dir(&d).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    out.insert(path.clone(), fs::read(&path).unwrap());
                }
            }
        }
        out
    }

    fn typed(err: &anyhow::Error) -> &FinetuneError {
        err.downcast_ref::<FinetuneError>().expect("typed error")
    }

    /// Hands out one fixed directory.
    struct FixedLocator(PathBuf);

    impl RunLocator for FixedLocator {
        fn allocate(&self, _config: &Config) -> Result<PathBuf> {
            fs::create_dir_all(self.0.parent().unwrap())?;
            fs::create_dir(&self.0)?;
            Ok(self.0.clone())
        }
    }

    /// Records the trainable keys of every request and trains nothing.
    #[derive(Clone, Default)]
    struct RecordingTrainer {
        masks: Rc<RefCell<Vec<Vec<String>>>>,
    }

    impl TrainingLoop for RecordingTrainer {
        fn run(&self, request: TrainingRequest) -> Result<Vec<Checkpoint>> {
            let keys = request.settings.mask.trainable_keys().map(str::to_string).collect();
            self.masks.borrow_mut().push(keys);
            Ok(Vec::new())
        }
    }

    /// Writes epoch 1, then diverges.
    struct DivergingTrainer;

    impl TrainingLoop for DivergingTrainer {
        fn run(&self, request: TrainingRequest) -> Result<Vec<Checkpoint>> {
            let snapshot = request.model.export_parameters()?;
            CheckpointStore::new().save(&snapshot, &request.settings.run_dir, 1, request.model.architecture())?;
            anyhow::bail!("Training loss became NaN in epoch 2")
        }
    }

    /// Scores every basin 0.5 on every metric.
    struct FixedScores;

    impl MetricEngine for FixedScores {
        fn evaluate(
            &self,
            _model:  &HydroModel<InferBackend>,
            dataset: &BasinDataset,
            _scaler: &FeatureScaler,
            metrics: &[Metric],
        ) -> Result<BasinResults> {
            Ok(dataset
                .basins()
                .iter()
                .map(|b| (b.clone(), metrics.iter().map(|m| (m.name().to_string(), 0.5)).collect()))
                .collect())
        }
    }

    #[test]
    fn test_start_completes_and_persists_everything() {
        let fx  = Fixture::new();
        let run = fx.orchestrator().start(&fx.config()).unwrap();

        assert_eq!(run.kind, RunKind::Base);
        assert_eq!(run.checkpoints.len(), 2);
        assert_eq!(run_store::read_state(&run.run_dir).unwrap(), RunState::Completed);
        assert!(run.run_dir.join("train_data/scaler.yml").is_file());

        let saved = run_store::load_config(&run.run_dir).unwrap();
        assert!(!saved.is_finetuning());
        assert_eq!(saved.run_dir().unwrap(), run.run_dir);
    }

    #[test]
    fn test_finetune_head_only_leaves_base_untouched() {
        let fx   = Fixture::new();
        let orch = fx.orchestrator();
        let base = orch.start(&fx.config()).unwrap();
        let base_files = dir_bytes(&base.run_dir);

        let overrides = fx
            .overrides(&base.run_dir, &["head"])
            .with("train_basin_file", format!("{}/one_basin.txt", fx.data_dir.display()));
        let ft = orch.finetune(&overrides).unwrap();

        assert_ne!(ft.run_dir, base.run_dir);
        assert_eq!(dir_bytes(&base.run_dir), base_files);
        assert_eq!(run_store::read_state(&ft.run_dir).unwrap(), RunState::Completed);

        let cfg = run_store::load_config(&ft.run_dir).unwrap();
        assert!(cfg.is_finetuning());
        assert_eq!(cfg.base_run_dir().unwrap(), base.run_dir);
        assert_eq!(cfg.hidden_size().unwrap(), 4);

        assert_eq!(
            fs::read(base.run_dir.join("train_data/scaler.yml")).unwrap(),
            fs::read(ft.run_dir.join("train_data/scaler.yml")).unwrap()
        );

        let store = CheckpointStore::new();
        let before: ParameterSnapshot = store.load(base.latest_checkpoint().unwrap()).unwrap();
        let after:  ParameterSnapshot = store.load(ft.latest_checkpoint().unwrap()).unwrap();
        for key in ["embedding_net.weight", "lstm.input_transform.weight", "lstm.hidden_transform.weight"] {
            assert!(after.get(key).unwrap().bits_eq(before.get(key).unwrap()), "{key} changed");
        }
    }

    #[test]
    fn test_finetune_conflict_allocates_nothing() {
        let fx   = Fixture::new();
        let orch = fx.orchestrator();
        let base = orch.start(&fx.config()).unwrap();
        let runs = fx.run_count();

        let err = orch
            .finetune(&fx.overrides(&base.run_dir, &["head"]).with("hidden_size", 64u64))
            .unwrap_err();
        assert!(matches!(typed(&err), FinetuneError::ConfigConflict { keys } if keys == &["hidden_size"]));
        assert_eq!(fx.run_count(), runs);
    }

    #[test]
    fn test_finetune_missing_base_run_dir() {
        let fx  = Fixture::new();
        let overrides = Config::default().with(keys::FINETUNE_MODULES, vec![Value::from("head")]);
        let err = fx.orchestrator().finetune(&overrides).unwrap_err();
        assert!(matches!(typed(&err), FinetuneError::MissingRequiredField { field } if field == "base_run_dir"));
        assert_eq!(fx.run_count(), 0);
    }

    #[test]
    fn test_finetune_unknown_module_allocates_nothing() {
        let fx   = Fixture::new();
        let orch = fx.orchestrator();
        let base = orch.start(&fx.config()).unwrap();
        let runs = fx.run_count();

        let err = orch.finetune(&fx.overrides(&base.run_dir, &["input_gate"])).unwrap_err();
        assert!(matches!(typed(&err), FinetuneError::UnknownModule { .. }));
        assert_eq!(fx.run_count(), runs);
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let fx   = Fixture::new();
        let orch = fx.orchestrator();
        let run   = orch.start(&fx.config()).unwrap();
        let other = orch.start(&fx.config()).unwrap();
        let other_files = dir_bytes(&other.run_dir);

        let first = orch.evaluate(&run.run_dir, Period::Test, None).unwrap();
        assert_eq!(first.epoch, 2);
        assert!(first.path.ends_with("test/model_epoch002/test_metrics.csv"));
        let snapshot = dir_bytes(&run.run_dir);

        let second = orch.evaluate(&run.run_dir, Period::Test, None).unwrap();
        assert_eq!(second.path, first.path);
        assert_eq!(dir_bytes(&run.run_dir), snapshot);
        assert_eq!(first.results.keys().collect::<Vec<_>>(), ["b1", "b2"]);

        let earlier = orch.evaluate(&run.run_dir, Period::Validation, Some(1)).unwrap();
        assert!(earlier.path.ends_with("validation/model_epoch001/validation_metrics.csv"));
        assert_eq!(dir_bytes(&other.run_dir), other_files);
    }

    #[test]
    fn test_evaluate_writes_engine_scores() {
        let fx  = Fixture::new();
        let run = fx.orchestrator().start(&fx.config()).unwrap();

        let report = fx
            .orchestrator()
            .with_metrics(FixedScores)
            .evaluate(&run.run_dir, Period::Test, None)
            .unwrap();
        let written = read_results(&report.path).unwrap();
        assert_eq!(written, report.results);
        assert_eq!(written["b2"]["RMSE"], 0.5);
    }

    #[test]
    fn test_finetune_hands_the_module_mask_to_the_training_loop() {
        let fx      = Fixture::new();
        let base    = fx.orchestrator().start(&fx.config()).unwrap();
        let trainer = RecordingTrainer::default();

        let head_dir = fx.runs_root.join("fixed").join("head_only");
        let ft = fx
            .orchestrator()
            .with_locator(FixedLocator(head_dir.clone()))
            .with_trainer(trainer.clone())
            .finetune(&fx.overrides(&base.run_dir, &["head"]))
            .unwrap();
        assert_eq!(ft.run_dir, head_dir);
        assert_eq!(run_store::load_config(&head_dir).unwrap().run_dir().unwrap(), head_dir);

        let frozen_dir = fx.runs_root.join("fixed").join("frozen");
        fx.orchestrator()
            .with_locator(FixedLocator(frozen_dir.clone()))
            .with_trainer(trainer.clone())
            .finetune(&fx.overrides(&base.run_dir, &[]))
            .unwrap();
        assert_eq!(run_store::read_state(&frozen_dir).unwrap(), RunState::Completed);

        let masks = trainer.masks.borrow();
        assert_eq!(*masks, [vec!["head.bias".to_string(), "head.weight".to_string()], vec![]]);
    }

    #[test]
    fn test_finetune_rejects_failed_base() {
        let fx = Fixture::new();
        let err = fx.orchestrator().with_trainer(DivergingTrainer).start(&fx.config()).unwrap_err();
        assert!(format!("{err:#}").contains("NaN"));

        let base = fs::read_dir(&fx.runs_root).unwrap().next().unwrap().unwrap().path();
        assert_eq!(run_store::read_state(&base).unwrap(), RunState::Failed);
        assert_eq!(CheckpointStore::new().latest(&base).unwrap().epoch, 1);
        let runs = fx.run_count();

        let err = fx.orchestrator().finetune(&fx.overrides(&base, &["head"])).unwrap_err();
        assert!(matches!(
            typed(&err),
            FinetuneError::BaseRunNotCompleted { state: RunState::Failed, .. }
        ));
        assert_eq!(fx.run_count(), runs);
    }

    #[test]
    fn test_evaluate_rejects_unfinished_run() {
        let fx = Fixture::new();
        let dir = fx.runs_root.join("pending");
        fs::create_dir_all(&dir).unwrap();
        run_store::init_state(&dir).unwrap();

        let err = fx.orchestrator().evaluate(&dir, Period::Test, None).unwrap_err();
        assert!(matches!(typed(&err), FinetuneError::RunNotEvaluable { state: RunState::Created, .. }));
    }

    #[test]
    fn test_failure_after_allocation_marks_run_failed() {
        let fx = Fixture::new();
        fs::write(fx.data_dir.join("ghost.txt"), "no_such_basin\n").unwrap();
        let config = fx
            .config()
            .with("train_basin_file", format!("{}/ghost.txt", fx.data_dir.display()));

        assert!(fx.orchestrator().start(&config).is_err());

        let run_dir = fs::read_dir(&fx.runs_root).unwrap().next().unwrap().unwrap().path();
        let status  = run_store::read_status(&run_dir).unwrap();
        assert_eq!(status.state, RunState::Failed);
        assert!(status.error.is_some());
    }
}
