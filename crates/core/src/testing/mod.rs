//! Shared test utilities for mlora-core.
//!
//! Tiny frozen layers and adapters with random, non-trivial weights, so that
//! every adapter visibly changes the output of the rows it owns.

use candle_core::{DType, Device, Tensor};
use candle_nn::Activation;

use crate::lora::{LinearAdapter, LoraAdapter, TargetModule};
use crate::shared::{FrozenFeedForward, FrozenLinear};

/// Dense frozen projection named `proj` with `N(0, 1)` weights.
pub fn tiny_dense(in_features: usize, out_features: usize, device: &Device) -> FrozenLinear {
    let weight = randn((out_features, in_features), device);
    FrozenLinear::new("proj", weight, None)
}

/// SwiGLU feed-forward with `N(0, 0.1)` weights.
pub fn tiny_feed_forward(hidden: usize, intermediate: usize, device: &Device) -> FrozenFeedForward {
    FrozenFeedForward::from_weights(
        (randn((intermediate, hidden), device) * 0.1).unwrap(),
        (randn((intermediate, hidden), device) * 0.1).unwrap(),
        (randn((hidden, intermediate), device) * 0.1).unwrap(),
        Activation::Silu,
    )
}

/// Adapter with random A and B (B is non-zero, unlike fresh training init).
pub fn random_adapter(modules: &[TargetModule], rank: usize, device: &Device) -> LinearAdapter {
    let alpha = 2.0 * rank as f32;
    let mut adapter = LinearAdapter::new(rank, alpha);
    for module in modules {
        let lora_a = randn((rank, module.in_features), device);
        let lora_b = randn((module.out_features, rank), device);
        adapter.add_module(module.name.clone(), LoraAdapter::new(lora_a, lora_b, rank, alpha));
    }
    adapter
}

pub fn randn(shape: (usize, usize), device: &Device) -> Tensor {
    Tensor::randn(0f32, 1.0, shape, device).unwrap()
}

/// Largest absolute elementwise difference.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_dtype(DType::F32)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

/// Elementwise equality of two f32 tensors.
pub fn same_values(a: &Tensor, b: &Tensor) -> bool {
    let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
    let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
    a == b
}
