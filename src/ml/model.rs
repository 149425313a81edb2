// ============================================================
// Layer 5 — Rainfall-Runoff Models (Burn)
// ============================================================
// Two recurrent architectures, both predicting the target
// variables at the last step of an input window:
//
//   cudalstm  embedding_net → lstm → head
//             statics are appended to every timestep
//   ealstm    input_gate (statics only) + dynamic_gates → head
//
// Every learnable tensor sits in a Linear layer whose position
// in the module tree gives it a structural key, e.g.
// "lstm.input_transform.weight". Export, import and the
// trainability mask all work from those keys.

use burn::{
    module::{Param, ParamId},
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation::{sigmoid, tanh},
};

use crate::domain::architecture::Architecture;
use crate::domain::config::Config as RunConfig;
use crate::domain::error::{FinetuneError, Result};
use crate::ml::snapshot::{ParameterSnapshot, TensorRecord};
use crate::ml::trainability::TrainabilityMask;

// ─── Model configuration ─────────────────────────────────────────────────────
// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize.
#[derive(Config, Debug)]
pub struct HydroModelConfig {
    pub n_dynamic:   usize,
    pub n_static:    usize,
    pub n_targets:   usize,
    pub hidden_size: usize,
    #[config(default = 0.0)]
    pub dropout:     f64,
}

impl HydroModelConfig {
    /// Read the structural fields of a run configuration.
    pub fn from_run_config(config: &RunConfig) -> Result<(Architecture, Self)> {
        let architecture = config.architecture()?;
        let n_static     = config.static_attributes()?.len();
        if architecture == Architecture::EaLstm && n_static == 0 {
            return Err(FinetuneError::invalid(
                "static_attributes",
                "ealstm needs at least one static attribute to drive its input gate",
            ));
        }
        let model_cfg = HydroModelConfig::new(
            config.dynamic_inputs()?.len(),
            n_static,
            config.target_variables()?.len(),
            config.hidden_size()?,
        )
        .with_dropout(config.output_dropout()?);
        Ok((architecture, model_cfg))
    }

    pub fn init<B: Backend>(&self, architecture: Architecture, device: &B::Device) -> HydroModel<B> {
        match architecture {
            Architecture::CudaLstm => HydroModel::CudaLstm(self.init_cudalstm(device)),
            Architecture::EaLstm   => HydroModel::EaLstm(self.init_ealstm(device)),
        }
    }

    pub fn init_cudalstm<B: Backend>(&self, device: &B::Device) -> CudaLstm<B> {
        let h = self.hidden_size;
        CudaLstm {
            embedding_net: LinearConfig::new(self.n_dynamic + self.n_static, h).init(device),
            lstm:          RecurrentCell::new(h, h, 4, device),
            head:          LinearConfig::new(h, self.n_targets).init(device),
            dropout:       DropoutConfig::new(self.dropout).init(),
            n_static:      self.n_static,
        }
    }

    pub fn init_ealstm<B: Backend>(&self, device: &B::Device) -> EaLstm<B> {
        let h = self.hidden_size;
        EaLstm {
            input_gate:    LinearConfig::new(self.n_static, h).init(device),
            dynamic_gates: RecurrentCell::new(self.n_dynamic, h, 3, device),
            head:          LinearConfig::new(h, self.n_targets).init(device),
            dropout:       DropoutConfig::new(self.dropout).init(),
        }
    }
}

// ─── HydroNetwork ────────────────────────────────────────────────────────────
/// Shared surface of every architecture.
///
/// `linears` lists each Linear layer with its structural prefix, in
/// declaration order; `try_map_linears` rebuilds the network with each
/// layer replaced. Everything key-based is derived from these two.
pub trait HydroNetwork<B: Backend>: Module<B> + Sized {
    /// x_dynamic: [batch, seq_len, n_dynamic], x_static: [batch, n_static]
    /// → [batch, n_targets]
    fn forward(&self, x_dynamic: Tensor<B, 3>, x_static: Tensor<B, 2>) -> Tensor<B, 2>;

    fn linears(&self) -> Vec<(&'static str, &Linear<B>)>;

    fn try_map_linears<F>(self, f: F) -> Result<Self>
    where
        F: FnMut(&'static str, Linear<B>) -> Result<Linear<B>>;
}

// ─── RecurrentCell ───────────────────────────────────────────────────────────
/// Input and recurrent projections for `gate_count` stacked gates.
#[derive(Module, Debug)]
pub struct RecurrentCell<B: Backend> {
    pub input_transform:  Linear<B>,
    pub hidden_transform: Linear<B>,
    pub hidden_size:      usize,
}

impl<B: Backend> RecurrentCell<B> {
    fn new(input_size: usize, hidden_size: usize, gate_count: usize, device: &B::Device) -> Self {
        Self {
            input_transform:  LinearConfig::new(input_size, gate_count * hidden_size).init(device),
            hidden_transform: LinearConfig::new(hidden_size, gate_count * hidden_size)
                .with_bias(false)
                .init(device),
            hidden_size,
        }
    }

    /// Pre-activations of all gates: [batch, gate_count * hidden].
    fn project(&self, x: Tensor<B, 2>, h: Tensor<B, 2>) -> Tensor<B, 2> {
        self.input_transform.forward(x) + self.hidden_transform.forward(h)
    }

    fn gate(&self, z: &Tensor<B, 2>, index: usize) -> Tensor<B, 2> {
        let [batch, _] = z.dims();
        let h = self.hidden_size;
        z.clone().slice([0..batch, index * h..(index + 1) * h])
    }
}

fn timestep<B: Backend>(x: &Tensor<B, 3>, t: usize) -> Tensor<B, 2> {
    let [batch, _, features] = x.dims();
    x.clone().slice([0..batch, t..t + 1, 0..features]).reshape([batch, features])
}

// ─── CudaLstm ────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct CudaLstm<B: Backend> {
    pub embedding_net: Linear<B>,
    pub lstm:          RecurrentCell<B>,
    pub head:          Linear<B>,
    pub dropout:       Dropout,
    pub n_static:      usize,
}

impl<B: Backend> HydroNetwork<B> for CudaLstm<B> {
    fn forward(&self, x_dynamic: Tensor<B, 3>, x_static: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, seq_len, _] = x_dynamic.dims();
        let device = x_dynamic.device();

        let mut h = Tensor::<B, 2>::zeros([batch, self.lstm.hidden_size], &device);
        let mut c = h.clone();

        for t in 0..seq_len {
            let x_t = timestep(&x_dynamic, t);
            let x_t = if self.n_static > 0 {
                Tensor::cat(vec![x_t, x_static.clone()], 1)
            } else {
                x_t
            };
            let x_t = tanh(self.embedding_net.forward(x_t));

            // Gate order: input, forget, cell candidate, output
            let z = self.lstm.project(x_t, h);
            let i = sigmoid(self.lstm.gate(&z, 0));
            let f = sigmoid(self.lstm.gate(&z, 1));
            let g = tanh(self.lstm.gate(&z, 2));
            let o = sigmoid(self.lstm.gate(&z, 3));

            c = f * c + i * g;
            h = o * tanh(c.clone());
        }

        self.head.forward(self.dropout.forward(h))
    }

    fn linears(&self) -> Vec<(&'static str, &Linear<B>)> {
        vec![
            ("embedding_net",         &self.embedding_net),
            ("lstm.input_transform",  &self.lstm.input_transform),
            ("lstm.hidden_transform", &self.lstm.hidden_transform),
            ("head",                  &self.head),
        ]
    }

    fn try_map_linears<F>(mut self, mut f: F) -> Result<Self>
    where
        F: FnMut(&'static str, Linear<B>) -> Result<Linear<B>>,
    {
        self.embedding_net         = f("embedding_net", self.embedding_net)?;
        self.lstm.input_transform  = f("lstm.input_transform", self.lstm.input_transform)?;
        self.lstm.hidden_transform = f("lstm.hidden_transform", self.lstm.hidden_transform)?;
        self.head                  = f("head", self.head)?;
        Ok(self)
    }
}

// ─── EaLstm ──────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct EaLstm<B: Backend> {
    pub input_gate:    Linear<B>,
    pub dynamic_gates: RecurrentCell<B>,
    pub head:          Linear<B>,
    pub dropout:       Dropout,
}

impl<B: Backend> HydroNetwork<B> for EaLstm<B> {
    fn forward(&self, x_dynamic: Tensor<B, 3>, x_static: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, seq_len, _] = x_dynamic.dims();
        let device = x_dynamic.device();

        // Input gate depends on the catchment only, not on time.
        let i = sigmoid(self.input_gate.forward(x_static));

        let mut h = Tensor::<B, 2>::zeros([batch, self.dynamic_gates.hidden_size], &device);
        let mut c = h.clone();

        for t in 0..seq_len {
            // Gate order: forget, cell candidate, output
            let z = self.dynamic_gates.project(timestep(&x_dynamic, t), h);
            let f = sigmoid(self.dynamic_gates.gate(&z, 0));
            let g = tanh(self.dynamic_gates.gate(&z, 1));
            let o = sigmoid(self.dynamic_gates.gate(&z, 2));

            c = f * c + i.clone() * g;
            h = o * tanh(c.clone());
        }

        self.head.forward(self.dropout.forward(h))
    }

    fn linears(&self) -> Vec<(&'static str, &Linear<B>)> {
        vec![
            ("input_gate",                     &self.input_gate),
            ("dynamic_gates.input_transform",  &self.dynamic_gates.input_transform),
            ("dynamic_gates.hidden_transform", &self.dynamic_gates.hidden_transform),
            ("head",                           &self.head),
        ]
    }

    fn try_map_linears<F>(mut self, mut f: F) -> Result<Self>
    where
        F: FnMut(&'static str, Linear<B>) -> Result<Linear<B>>,
    {
        self.input_gate                     = f("input_gate", self.input_gate)?;
        self.dynamic_gates.input_transform  = f("dynamic_gates.input_transform", self.dynamic_gates.input_transform)?;
        self.dynamic_gates.hidden_transform = f("dynamic_gates.hidden_transform", self.dynamic_gates.hidden_transform)?;
        self.head                           = f("head", self.head)?;
        Ok(self)
    }
}

// ─── Key-based parameter access ──────────────────────────────────────────────

/// (key, shape) of every parameter, in declaration order.
pub fn parameter_shapes<B: Backend, N: HydroNetwork<B>>(net: &N) -> Vec<(String, Vec<usize>)> {
    let mut shapes = Vec::new();
    for (prefix, linear) in net.linears() {
        shapes.push((format!("{prefix}.weight"), linear.weight.val().dims().to_vec()));
        if let Some(bias) = &linear.bias {
            shapes.push((format!("{prefix}.bias"), bias.val().dims().to_vec()));
        }
    }
    shapes
}

pub fn export_parameters<B: Backend, N: HydroNetwork<B>>(net: &N) -> Result<ParameterSnapshot> {
    let mut snapshot = ParameterSnapshot::new();
    for (prefix, linear) in net.linears() {
        let key = format!("{prefix}.weight");
        snapshot.insert(key.clone(), TensorRecord::from_tensor(&key, linear.weight.val())?);
        if let Some(bias) = &linear.bias {
            let key = format!("{prefix}.bias");
            snapshot.insert(key.clone(), TensorRecord::from_tensor(&key, bias.val())?);
        }
    }
    Ok(snapshot)
}

/// Replace every parameter with the snapshot's value and set its
/// gradient flag from `mask`.
///
/// Keys must match one-to-one and every shape must agree; nothing is
/// skipped silently.
pub fn import_parameters<B: Backend, N: HydroNetwork<B>>(
    net:      N,
    snapshot: &ParameterSnapshot,
    mask:     &TrainabilityMask,
) -> Result<N> {
    let shapes = parameter_shapes(&net);

    let missing: Vec<String> = shapes
        .iter()
        .filter(|(k, _)| snapshot.get(k).is_none())
        .map(|(k, _)| k.clone())
        .collect();
    let unexpected: Vec<String> = snapshot
        .keys()
        .filter(|k| !shapes.iter().any(|(s, _)| s == k))
        .map(str::to_string)
        .collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(FinetuneError::ParameterKeyMismatch { missing, unexpected });
    }

    for (key, expected) in &shapes {
        // Presence was checked above.
        if let Some(record) = snapshot.get(key) {
            if &record.shape != expected {
                return Err(FinetuneError::ParameterShapeMismatch {
                    key:      key.clone(),
                    expected: expected.clone(),
                    found:    record.shape.clone(),
                });
            }
        }
    }

    net.try_map_linears(|prefix, mut linear| {
        let device = linear.weight.val().device();
        linear.weight = load_param(&format!("{prefix}.weight"), snapshot, mask, &device)?;
        if linear.bias.is_some() {
            linear.bias = Some(load_param(&format!("{prefix}.bias"), snapshot, mask, &device)?);
        }
        Ok(linear)
    })
}

/// Set gradient flags from `mask` without touching any value.
pub fn apply_mask<B: Backend, N: HydroNetwork<B>>(net: N, mask: &TrainabilityMask) -> Result<N> {
    net.try_map_linears(|prefix, mut linear| {
        let key = format!("{prefix}.weight");
        linear.weight = Param::initialized(
            ParamId::new(),
            linear.weight.val().set_require_grad(mask.is_trainable(&key)),
        );
        if let Some(bias) = linear.bias.take() {
            let key = format!("{prefix}.bias");
            linear.bias = Some(Param::initialized(
                ParamId::new(),
                bias.val().set_require_grad(mask.is_trainable(&key)),
            ));
        }
        Ok(linear)
    })
}

fn load_param<B: Backend, const D: usize>(
    key:      &str,
    snapshot: &ParameterSnapshot,
    mask:     &TrainabilityMask,
    device:   &B::Device,
) -> Result<Param<Tensor<B, D>>> {
    let record = snapshot.get(key).ok_or_else(|| FinetuneError::ParameterKeyMismatch {
        missing:    vec![key.to_string()],
        unexpected: Vec::new(),
    })?;
    let tensor: Tensor<B, D> = record.to_tensor(device);
    Ok(Param::initialized(ParamId::new(), tensor.set_require_grad(mask.is_trainable(key))))
}

// ─── HydroModel ──────────────────────────────────────────────────────────────
/// An instantiated network of one of the declared architectures.
/// The variant is fixed when the model is built from its configuration.
#[derive(Debug, Clone)]
pub enum HydroModel<B: Backend> {
    CudaLstm(CudaLstm<B>),
    EaLstm(EaLstm<B>),
}

impl<B: Backend> HydroModel<B> {
    pub fn architecture(&self) -> Architecture {
        match self {
            HydroModel::CudaLstm(_) => Architecture::CudaLstm,
            HydroModel::EaLstm(_)   => Architecture::EaLstm,
        }
    }

    pub fn forward(&self, x_dynamic: Tensor<B, 3>, x_static: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            HydroModel::CudaLstm(m) => m.forward(x_dynamic, x_static),
            HydroModel::EaLstm(m)   => m.forward(x_dynamic, x_static),
        }
    }

    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        match self {
            HydroModel::CudaLstm(m) => parameter_shapes(m),
            HydroModel::EaLstm(m)   => parameter_shapes(m),
        }
    }

    pub fn parameter_keys(&self) -> Vec<String> {
        self.parameter_shapes().into_iter().map(|(k, _)| k).collect()
    }

    pub fn export_parameters(&self) -> Result<ParameterSnapshot> {
        match self {
            HydroModel::CudaLstm(m) => export_parameters(m),
            HydroModel::EaLstm(m)   => export_parameters(m),
        }
    }

    pub fn import_parameters(self, snapshot: &ParameterSnapshot, mask: &TrainabilityMask) -> Result<Self> {
        match self {
            HydroModel::CudaLstm(m) => import_parameters(m, snapshot, mask).map(HydroModel::CudaLstm),
            HydroModel::EaLstm(m)   => import_parameters(m, snapshot, mask).map(HydroModel::EaLstm),
        }
    }

    pub fn apply_mask(self, mask: &TrainabilityMask) -> Result<Self> {
        match self {
            HydroModel::CudaLstm(m) => apply_mask(m, mask).map(HydroModel::CudaLstm),
            HydroModel::EaLstm(m)   => apply_mask(m, mask).map(HydroModel::EaLstm),
        }
    }
}
