// ============================================================
// Layer 5 — Parameter Snapshot
// ============================================================
// Plain, backend-free copy of every learnable tensor in a model,
// keyed by structural path ("lstm.input_transform.weight").
// The keys come from where a tensor sits in the module tree, so
// a snapshot taken from one model instance can be matched
// against any freshly built model of the same structure.

use std::collections::BTreeMap;

use burn::prelude::*;

use crate::domain::error::{FinetuneError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct TensorRecord {
    pub shape:  Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorRecord {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }

    pub fn from_tensor<B: Backend, const D: usize>(key: &str, tensor: Tensor<B, D>) -> Result<Self> {
        let data  = tensor.into_data();
        let shape = data.shape.clone();
        let values = data
            .to_vec::<f32>()
            .map_err(|e| FinetuneError::invalid(key, format!("cannot read tensor values: {e:?}")))?;
        Ok(Self { shape, values })
    }

    pub fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Tensor<B, D> {
        Tensor::from_data(TensorData::new(self.values.clone(), self.shape.clone()), device)
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bitwise equality; NaN payloads compare equal to themselves.
    pub fn bits_eq(&self, other: &TensorRecord) -> bool {
        self.shape == other.shape
            && self.values.len() == other.values.len()
            && self.values.iter().zip(&other.values).all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSnapshot {
    tensors: BTreeMap<String, TensorRecord>,
}

impl ParameterSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, record: TensorRecord) {
        self.tensors.insert(key.into(), record);
    }

    pub fn get(&self, key: &str) -> Option<&TensorRecord> {
        self.tensors.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorRecord)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(TensorRecord::numel).sum()
    }

    /// True when both snapshots hold the same keys with bit-identical values.
    pub fn bits_eq(&self, other: &ParameterSnapshot) -> bool {
        self.tensors.len() == other.tensors.len()
            && self.tensors.iter().all(|(k, v)| other.get(k).is_some_and(|o| v.bits_eq(o)))
    }
}
