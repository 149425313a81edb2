// ============================================================
// Layer 5 — Transfer-Learning Initializer
// ============================================================
// Builds the model a run starts from:
//
//   fresh       random init, every parameter trainable   (start)
//   initialize  base run's latest checkpoint + mask       (finetune)
//   restore     a chosen checkpoint, all frozen           (evaluate)
//
// Shapes come from the run's own configuration; values come
// from the checkpoint, matched one-to-one by structural key.

use burn::prelude::*;

use crate::domain::config::Config;
use crate::domain::error::{FinetuneError, Result};
use crate::domain::run::Checkpoint;
use crate::infra::checkpoint::CheckpointStore;
use crate::ml::model::{HydroModel, HydroModelConfig};
use crate::ml::trainability::{select_trainable, TrainabilityMask};

pub fn fresh<B: Backend>(config: &Config, device: &B::Device) -> Result<(HydroModel<B>, TrainabilityMask)> {
    let (architecture, model_cfg) = HydroModelConfig::from_run_config(config)?;
    let model = model_cfg.init::<B>(architecture, device);
    let mask  = TrainabilityMask::all_trainable(model.parameter_keys());
    tracing::info!("Initialised fresh {} model ({} parameter tensors)", architecture, mask.len());
    Ok((model, mask))
}

/// Load the base run's latest checkpoint into a freshly built model and
/// unfreeze only the modules listed in `finetune_modules`.
///
/// Afterwards every parameter is bit-identical to the checkpoint.
pub fn initialize<B: Backend>(
    config: &Config,
    store:  &CheckpointStore,
    device: &B::Device,
) -> Result<(HydroModel<B>, TrainabilityMask)> {
    let base_run_dir = config
        .base_run_dir()
        .ok_or_else(|| FinetuneError::missing(crate::domain::config::keys::BASE_RUN_DIR))?;

    let (architecture, model_cfg) = HydroModelConfig::from_run_config(config)?;
    let model = model_cfg.init::<B>(architecture, device);
    let mask  = select_trainable(architecture, &model.parameter_keys(), &config.finetune_modules()?)?;

    let checkpoint = store.latest(&base_run_dir)?;
    let snapshot   = store.load(&checkpoint)?;
    let model      = model.import_parameters(&snapshot, &mask)?;

    tracing::info!(
        "Transferred {} parameters from '{}' (epoch {})",
        snapshot.parameter_count(),
        base_run_dir.display(),
        checkpoint.epoch
    );
    Ok((model, mask))
}

/// Rebuild a run's model at `checkpoint` for inference.
pub fn restore<B: Backend>(
    config:     &Config,
    store:      &CheckpointStore,
    checkpoint: &Checkpoint,
    device:     &B::Device,
) -> Result<HydroModel<B>> {
    let (architecture, model_cfg) = HydroModelConfig::from_run_config(config)?;
    let model    = model_cfg.init::<B>(architecture, device);
    let mask     = TrainabilityMask::all_frozen(model.parameter_keys());
    let meta     = store.metadata(checkpoint)?;
    tracing::debug!(
        "Restoring {} checkpoint '{}' (saved as {})",
        architecture,
        checkpoint.path.display(),
        meta.get("architecture").map(String::as_str).unwrap_or("unknown"),
    );
    let snapshot = store.load(checkpoint)?;
    model.import_parameters(&snapshot, &mask)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::InferBackend;
    use serde_yaml::Value;
    use std::path::Path;

    const BASE: &str = "model: cudalstm\nhidden_size: 6\ndynamic_inputs: [prcp, tmax]\n\
                        static_attributes: [area]\ntarget_variables: [qobs]\n";

    fn finetune_config(base_run_dir: &Path, modules: &[&str]) -> Config {
        Config::from_yaml_str(BASE)
            .unwrap()
            .with("base_run_dir", base_run_dir.to_string_lossy().into_owned())
            .with("finetune_modules", modules.iter().map(|m| Value::from(*m)).collect::<Vec<_>>())
    }

    fn save_base(dir: &Path, config: &Config, epoch: usize) -> HydroModel<InferBackend> {
        let (model, _) = fresh::<InferBackend>(config, &Default::default()).unwrap();
        CheckpointStore::new()
            .save(&model.export_parameters().unwrap(), dir, epoch, model.architecture())
            .unwrap();
        model
    }

    #[test]
    fn test_initialize_loads_latest_bit_identical() {
        let base  = tempfile::tempdir().unwrap();
        let cfg   = Config::from_yaml_str(BASE).unwrap();
        save_base(base.path(), &cfg, 1);
        let latest = save_base(base.path(), &cfg, 2);

        let (model, mask) = initialize::<InferBackend>(
            &finetune_config(base.path(), &["head"]),
            &CheckpointStore::new(),
            &Default::default(),
        )
        .unwrap();

        assert!(model.export_parameters().unwrap().bits_eq(&latest.export_parameters().unwrap()));
        assert_eq!(mask.trainable_keys().collect::<Vec<_>>(), ["head.bias", "head.weight"]);
    }

    #[test]
    fn test_initialize_without_checkpoint() {
        let base = tempfile::tempdir().unwrap();
        let err = initialize::<InferBackend>(
            &finetune_config(base.path(), &[]),
            &CheckpointStore::new(),
            &Default::default(),
        )
        .unwrap_err();
        assert!(matches!(err, FinetuneError::NoCheckpointFound { .. }));
    }

    #[test]
    fn test_initialize_rejects_shape_change() {
        let base = tempfile::tempdir().unwrap();
        let wide = Config::from_yaml_str(BASE).unwrap().with("hidden_size", 12u64);
        save_base(base.path(), &wide, 1);

        let err = initialize::<InferBackend>(
            &finetune_config(base.path(), &["head"]),
            &CheckpointStore::new(),
            &Default::default(),
        )
        .unwrap_err();
        assert!(matches!(err, FinetuneError::ParameterShapeMismatch { .. }));
    }

    #[test]
    fn test_unknown_module_fails_before_loading() {
        let base = tempfile::tempdir().unwrap();
        let err = initialize::<InferBackend>(
            &finetune_config(base.path(), &["decoder"]),
            &CheckpointStore::new(),
            &Default::default(),
        )
        .unwrap_err();
        assert!(matches!(err, FinetuneError::UnknownModule { .. }));
    }
}
