//! Frozen shared computations augmented by adapters.
//!
//! A [`SharedLayer`] is the base-model computation every batch row goes
//! through. The routing layer asks it for the plain frozen output, or for the
//! output with one adapter's low-rank deltas folded into its projections.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Activation, Linear};

use crate::lora::{LinearAdapter, TargetModule};

/// Frozen base computation shared by every adapter.
pub trait SharedLayer: Send + Sync {
    /// Frozen output without any adapter.
    fn base_forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Output with `adapter`'s deltas applied to each projection it targets.
    ///
    /// `activation` replaces the layer's own nonlinearity; mixture experts
    /// may carry their own.
    fn adapter_forward(
        &self,
        adapter: &LinearAdapter,
        activation: Activation,
        xs: &Tensor,
    ) -> Result<Tensor>;

    /// The layer's own nonlinearity.
    fn activation(&self) -> Activation;

    /// Size of the last input dimension.
    fn hidden_size(&self) -> usize;

    /// Size of the last output dimension.
    fn output_size(&self) -> usize;

    /// Projections that can carry a delta.
    fn target_modules(&self) -> Vec<TargetModule>;
}

/// Frozen dense projection `y = x W^T (+ b)` with a module name.
#[derive(Debug, Clone)]
pub struct FrozenLinear {
    name: String,
    linear: Linear,
}

impl FrozenLinear {
    pub fn new(name: impl Into<String>, weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            name: name.into(),
            linear: Linear::new(weight, bias),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_features(&self) -> usize {
        self.linear.weight().dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.linear.weight().dims()[0]
    }

    /// Frozen projection plus `adapter`'s delta for this module, if any.
    pub fn forward_with(&self, adapter: &LinearAdapter, xs: &Tensor) -> Result<Tensor> {
        adapter.apply(&self.name, xs, self.linear.forward(xs)?)
    }

    fn as_target(&self) -> TargetModule {
        TargetModule::new(self.name.clone(), self.in_features(), self.out_features())
    }
}

impl Module for FrozenLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.linear.forward(xs)
    }
}

impl SharedLayer for FrozenLinear {
    fn base_forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward(xs)
    }

    /// `base(x) + delta(x)`; a single projection has no nonlinearity.
    fn adapter_forward(
        &self,
        adapter: &LinearAdapter,
        _activation: Activation,
        xs: &Tensor,
    ) -> Result<Tensor> {
        self.forward_with(adapter, xs)
    }

    fn activation(&self) -> Activation {
        Activation::Relu
    }

    fn hidden_size(&self) -> usize {
        self.in_features()
    }

    fn output_size(&self) -> usize {
        self.out_features()
    }

    fn target_modules(&self) -> Vec<TargetModule> {
        vec![self.as_target()]
    }
}

/// Frozen gated feed-forward: `down(act(gate(x)) * up(x))`.
///
/// Projections are named `gate_proj`, `up_proj` and `down_proj`; adapters
/// key their deltas by these names.
#[derive(Debug, Clone)]
pub struct FrozenFeedForward {
    gate_proj: FrozenLinear,
    up_proj: FrozenLinear,
    down_proj: FrozenLinear,
    act: Activation,
}

impl FrozenFeedForward {
    pub const GATE_PROJ: &'static str = "gate_proj";
    pub const UP_PROJ: &'static str = "up_proj";
    pub const DOWN_PROJ: &'static str = "down_proj";

    /// Build from weights `[intermediate, hidden]`, `[intermediate, hidden]`
    /// and `[hidden, intermediate]`.
    pub fn from_weights(gate: Tensor, up: Tensor, down: Tensor, act: Activation) -> Self {
        Self {
            gate_proj: FrozenLinear::new(Self::GATE_PROJ, gate, None),
            up_proj: FrozenLinear::new(Self::UP_PROJ, up, None),
            down_proj: FrozenLinear::new(Self::DOWN_PROJ, down, None),
            act,
        }
    }

    pub fn intermediate_size(&self) -> usize {
        self.gate_proj.out_features()
    }
}

impl Module for FrozenFeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(xs)?.apply(&self.act)?;
        let up = self.up_proj.forward(xs)?;
        (gate * up)?.apply(&self.down_proj)
    }
}

impl SharedLayer for FrozenFeedForward {
    fn base_forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward(xs)
    }

    fn adapter_forward(
        &self,
        adapter: &LinearAdapter,
        activation: Activation,
        xs: &Tensor,
    ) -> Result<Tensor> {
        let gate = self.gate_proj.forward_with(adapter, xs)?.apply(&activation)?;
        let up = self.up_proj.forward_with(adapter, xs)?;
        let hidden = (gate * up)?;
        self.down_proj.forward_with(adapter, &hidden)
    }

    fn activation(&self) -> Activation {
        self.act
    }

    fn hidden_size(&self) -> usize {
        self.gate_proj.in_features()
    }

    fn output_size(&self) -> usize {
        self.down_proj.out_features()
    }

    fn target_modules(&self) -> Vec<TargetModule> {
        vec![
            self.gate_proj.as_target(),
            self.up_proj.as_target(),
            self.down_proj.as_target(),
        ]
    }
}
