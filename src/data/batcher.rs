// ============================================================
// Layer 4 — Hydro Batcher
// ============================================================
// Stacks HydroSamples into the three tensors the models take:
//
//   x_dynamic  [batch, seq_length, n_dynamic]
//   x_static   [batch, n_static]      (n_static may be 0)
//   y          [batch, n_targets]
//
// Every sample of a dataset shares one layout, so batching is
// a flatten followed by a reshape.

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
};

use crate::data::dataset::{HydroSample, SampleLayout};

#[derive(Debug, Clone)]
pub struct HydroBatch<B: Backend> {
    pub x_dynamic: Tensor<B, 3>,
    pub x_static:  Tensor<B, 2>,
    pub y:         Tensor<B, 2>,
}

#[derive(Clone, Debug)]
pub struct HydroBatcher<B: Backend> {
    pub device: B::Device,
    pub layout: SampleLayout,
}

impl<B: Backend> HydroBatcher<B> {
    pub fn new(device: B::Device, layout: SampleLayout) -> Self {
        Self { device, layout }
    }
}

impl<B: Backend> Batcher<HydroSample, HydroBatch<B>> for HydroBatcher<B> {
    fn batch(&self, items: Vec<HydroSample>) -> HydroBatch<B> {
        let n = items.len();
        let SampleLayout { seq_length, n_dynamic, n_static, n_targets } = self.layout;

        let dynamic: Vec<f32> = items.iter().flat_map(|s| s.dynamic.iter().copied()).collect();
        let statics: Vec<f32> = items.iter().flat_map(|s| s.statics.iter().copied()).collect();
        let targets: Vec<f32> = items.iter().flat_map(|s| s.target.iter().copied()).collect();

        HydroBatch {
            x_dynamic: Tensor::from_data(TensorData::new(dynamic, [n, seq_length, n_dynamic]), &self.device),
            x_static:  Tensor::from_data(TensorData::new(statics, [n, n_static]), &self.device),
            y:         Tensor::from_data(TensorData::new(targets, [n, n_targets]), &self.device),
        }
    }
}
