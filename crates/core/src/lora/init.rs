//! Random initialization of adapter and gate weights.

use candle_core::{DType, Device, Result, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::{LinearAdapter, LoraAdapter};

/// Projection a LoRA delta can target on a shared layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetModule {
    pub name: String,
    pub in_features: usize,
    pub out_features: usize,
}

impl TargetModule {
    pub fn new(name: impl Into<String>, in_features: usize, out_features: usize) -> Self {
        Self {
            name: name.into(),
            in_features,
            out_features,
        }
    }
}

/// Seedable weight initializer.
///
/// A is drawn Kaiming-uniform (`a = sqrt(5)`, i.e. bound `1 / sqrt(fan_in)`)
/// and B is zero, so a freshly initialized adapter starts as the identity
/// delta. Gate weights are drawn from `Normal(0, std)`.
pub struct WeightInit {
    rng: StdRng,
    device: Device,
    dtype: DType,
}

impl WeightInit {
    pub fn new(seed: Option<u64>, device: &Device, dtype: DType) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            device: device.clone(),
            dtype,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Tensor with entries drawn from `Normal(0, std)`.
    pub fn normal<S: Into<Shape>>(&mut self, shape: S, std: f32) -> Result<Tensor> {
        let shape = shape.into();
        let normal = Normal::new(0f32, std)
            .map_err(|e| candle_core::Error::Msg(format!("invalid normal std {std}: {e}")))?;
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| normal.sample(&mut self.rng))
            .collect();
        Tensor::from_vec(data, shape, &self.device)?.to_dtype(self.dtype)
    }

    /// Tensor with entries drawn uniformly from `[-bound, bound)`.
    pub fn uniform<S: Into<Shape>>(&mut self, shape: S, bound: f32) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| (self.rng.gen::<f32>() * 2.0 - 1.0) * bound)
            .collect();
        Tensor::from_vec(data, shape, &self.device)?.to_dtype(self.dtype)
    }

    /// Fresh delta for one projection.
    pub fn lora(
        &mut self,
        module: &TargetModule,
        rank: usize,
        alpha: f32,
        use_rslora: bool,
    ) -> Result<LoraAdapter> {
        let bound = 1.0 / (module.in_features.max(1) as f32).sqrt();
        let lora_a = self.uniform((rank, module.in_features), bound)?;
        let lora_b = Tensor::zeros((module.out_features, rank), self.dtype, &self.device)?;
        Ok(if use_rslora {
            LoraAdapter::new_with_rslora(lora_a, lora_b, rank, alpha)
        } else {
            LoraAdapter::new(lora_a, lora_b, rank, alpha)
        })
    }

    /// Fresh adapter covering `modules`.
    pub fn linear_adapter(
        &mut self,
        modules: &[TargetModule],
        rank: usize,
        alpha: f32,
        use_rslora: bool,
    ) -> Result<LinearAdapter> {
        let mut adapter = LinearAdapter::new(rank, alpha);
        for module in modules {
            adapter.add_module(module.name.clone(), self.lora(module, rank, alpha, use_rslora)?);
        }
        Ok(adapter)
    }
}
