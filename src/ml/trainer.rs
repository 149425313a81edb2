// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Train + validation loop using Burn's DataLoader and Adam.
//
//   - Training runs on TrainBackend (Autodiff<NdArray>)
//   - model.valid() returns the same network on InferBackend
//     for validation, with dropout disabled
//   - Frozen parameters carry require_grad = false, so they get
//     no gradient and Adam never touches them
//   - With nothing trainable, backward and the optimiser step
//     are skipped altogether
//   - One checkpoint per epoch, through the CheckpointStore
//
// Reference: Burn Book §5, Kingma & Ba (2015) Adam

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    nn::loss::{MseLoss, Reduction},
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
};

use crate::data::{batcher::HydroBatcher, dataset::BasinDataset};
use crate::domain::architecture::Architecture;
use crate::domain::config::LearningRateSchedule;
use crate::domain::run::Checkpoint;
use crate::infra::{
    checkpoint::CheckpointStore,
    metrics::{EpochMetrics, MetricsLogger},
};
use crate::ml::model::{export_parameters, HydroModel, HydroNetwork};
use crate::ml::trainability::TrainabilityMask;
use crate::ml::{InferBackend, TrainBackend};

// ─── TrainingLoop ────────────────────────────────────────────────────────────

/// Everything a training loop needs besides the model.
#[derive(Debug, Clone)]
pub struct TrainingSettings {
    pub mask:           TrainabilityMask,
    pub train:          BasinDataset,
    pub validation:     Option<BasinDataset>,
    pub schedule:       LearningRateSchedule,
    pub epochs:         usize,
    pub batch_size:     usize,
    pub seed:           Option<u64>,
    pub validate_every: Option<usize>,
    pub run_dir:        PathBuf,
}

pub struct TrainingRequest {
    pub model:    HydroModel<TrainBackend>,
    pub settings: TrainingSettings,
}

/// Runs all epochs of one run and returns the checkpoints written,
/// in epoch order. Frozen parameters must come out unchanged.
pub trait TrainingLoop {
    fn run(&self, request: TrainingRequest) -> Result<Vec<Checkpoint>>;
}

// ─── BurnTrainer ─────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Default)]
pub struct BurnTrainer {
    store: CheckpointStore,
}

impl BurnTrainer {
    pub fn new(store: CheckpointStore) -> Self {
        Self { store }
    }
}

impl TrainingLoop for BurnTrainer {
    fn run(&self, request: TrainingRequest) -> Result<Vec<Checkpoint>> {
        let TrainingRequest { model, settings } = request;
        let architecture = model.architecture();
        match model {
            HydroModel::CudaLstm(m) => self.fit(m, architecture, &settings),
            HydroModel::EaLstm(m)   => self.fit(m, architecture, &settings),
        }
    }
}

impl BurnTrainer {
    fn fit<M>(&self, mut model: M, architecture: Architecture, cfg: &TrainingSettings) -> Result<Vec<Checkpoint>>
    where
        M: HydroNetwork<TrainBackend> + AutodiffModule<TrainBackend>,
        M::InnerModule: HydroNetwork<InferBackend>,
    {
        if cfg.train.sample_count() == 0 {
            bail!("Training dataset is empty: no basin has a complete input window in the train period");
        }

        let device = <TrainBackend as Backend>::Device::default();
        if let Some(seed) = cfg.seed {
            <TrainBackend as Backend>::seed(seed);
        }

        let update = cfg.mask.has_trainable();
        tracing::info!(
            "Training {} for {} epochs on {} samples ({} trainable parameter tensors)",
            architecture,
            cfg.epochs,
            cfg.train.sample_count(),
            cfg.mask.trainable_count(),
        );

        // ── Adam optimiser ────────────────────────────────────────────────────
        let mut optim = AdamConfig::new().with_epsilon(1e-8).init();

        // ── Training data loader (AutodiffBackend) ────────────────────────────
        let train_batcher = HydroBatcher::<TrainBackend>::new(device.clone(), cfg.train.layout());
        let train_loader  = DataLoaderBuilder::new(train_batcher)
            .batch_size(cfg.batch_size)
            .shuffle(cfg.seed.unwrap_or(42))
            .num_workers(1)
            .build(cfg.train.clone());

        // ── Validation data loader (InnerBackend, no autodiff overhead) ───────
        let val_loader = cfg.validation.as_ref().filter(|v| v.sample_count() > 0).map(|val| {
            let val_batcher = HydroBatcher::<InferBackend>::new(device.clone(), val.layout());
            DataLoaderBuilder::new(val_batcher)
                .batch_size(cfg.batch_size)
                .num_workers(1)
                .build(val.clone())
        });

        let logger = MetricsLogger::new(&cfg.run_dir)?;
        let mse    = MseLoss::new();
        let mut checkpoints = Vec::with_capacity(cfg.epochs);
        let mut best_val    = f64::INFINITY;

        for epoch in 1..=cfg.epochs {
            let lr = cfg.schedule.rate_for(epoch);

            // ── Training phase ────────────────────────────────────────────────
            let mut train_loss_sum = 0.0f64;
            let mut train_batches  = 0usize;

            for batch in train_loader.iter() {
                let pred = model.forward(batch.x_dynamic, batch.x_static);
                let loss = mse.forward(pred, batch.y, Reduction::Mean);

                let loss_val: f64 = loss.clone().into_scalar().elem::<f64>();
                if !loss_val.is_finite() {
                    bail!("Training loss became {loss_val} in epoch {epoch}");
                }
                train_loss_sum += loss_val;
                train_batches  += 1;

                if update {
                    let grads = loss.backward();
                    let grads = GradientsParams::from_grads(grads, &model);
                    model = optim.step(lr, model, grads);
                }
            }

            let avg_train_loss = train_loss_sum / train_batches.max(1) as f64;

            // ── Validation phase ──────────────────────────────────────────────
            let validate_now = cfg.validate_every.is_some_and(|n| n > 0 && epoch % n == 0);
            let avg_val_loss = match (&val_loader, validate_now) {
                (Some(loader), true) => {
                    let model_valid = model.valid();
                    let mut sum     = 0.0f64;
                    let mut batches = 0usize;
                    for batch in loader.iter() {
                        let pred = model_valid.forward(batch.x_dynamic, batch.x_static);
                        sum += MseLoss::new()
                            .forward(pred, batch.y, Reduction::Mean)
                            .into_scalar()
                            .elem::<f64>();
                        batches += 1;
                    }
                    sum / batches.max(1) as f64
                }
                _ => f64::NAN,
            };

            tracing::info!(
                "Epoch {:>3}/{} | lr={:.2e} | train_loss={:.4} | val_loss={:.4}",
                epoch, cfg.epochs, lr, avg_train_loss, avg_val_loss,
            );
            let metrics = EpochMetrics::new(epoch, avg_train_loss, avg_val_loss);
            if metrics.is_improvement(best_val) {
                best_val = metrics.val_loss;
                tracing::info!("  New best validation loss: {:.4}", best_val);
            }
            logger.log(&metrics)?;

            let snapshot   = export_parameters::<TrainBackend, M>(&model)?;
            let checkpoint = self
                .store
                .save(&snapshot, &cfg.run_dir, epoch, architecture)
                .with_context(|| format!("Cannot save checkpoint for epoch {epoch}"))?;
            checkpoints.push(checkpoint);
        }

        tracing::info!("Training complete!");
        Ok(checkpoints)
    }
}
