//! Low-rank adapter weights.

use std::collections::HashMap;

use candle_core::{Result, Tensor};

use super::TargetModule;

/// Low-rank delta for a single projection (matrices A and B).
///
/// The delta is:
/// ```text
/// delta(x) = scale * (x @ lora_a.T @ lora_b.T)
/// ```
///
/// Where:
/// - lora_a: [rank, input_dim]
/// - lora_b: [output_dim, rank]
/// - scale: alpha / rank (alpha / sqrt(rank) for rsLoRA)
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    /// Down-projection A: [rank, input_dim].
    pub lora_a: Tensor,
    /// Up-projection B: [output_dim, rank].
    pub lora_b: Tensor,
    /// LoRA rank.
    pub rank: usize,
    /// Alpha parameter.
    pub alpha: f32,
    /// Pre-computed scale.
    pub scale: f32,
}

impl LoraAdapter {
    /// Create a new adapter with `alpha / rank` scaling.
    pub fn new(lora_a: Tensor, lora_b: Tensor, rank: usize, alpha: f32) -> Self {
        let scale = alpha / rank as f32;
        Self {
            lora_a,
            lora_b,
            rank,
            alpha,
            scale,
        }
    }

    /// Create with rank-stabilized scaling (rsLoRA).
    pub fn new_with_rslora(lora_a: Tensor, lora_b: Tensor, rank: usize, alpha: f32) -> Self {
        let scale = alpha / (rank as f32).sqrt();
        Self {
            lora_a,
            lora_b,
            rank,
            alpha,
            scale,
        }
    }

    /// Input dimension (from lora_a shape).
    pub fn input_dim(&self) -> usize {
        self.lora_a.dims()[1]
    }

    /// Output dimension (from lora_b shape).
    pub fn output_dim(&self) -> usize {
        self.lora_b.dims()[0]
    }

    /// Check that A and B agree with each other and with `rank`.
    ///
    /// Returns a human-readable reason on mismatch.
    pub fn check_shapes(&self) -> std::result::Result<(), String> {
        let a = self.lora_a.dims();
        let b = self.lora_b.dims();
        if a.len() != 2 || b.len() != 2 {
            return Err(format!("expected 2D A and B, got A {a:?} and B {b:?}"));
        }
        if a[0] != self.rank || b[1] != self.rank {
            return Err(format!(
                "rank {} does not match A {a:?} and B {b:?}",
                self.rank
            ));
        }
        Ok(())
    }

    /// Compute the low-rank delta for `x` of shape `[..., input_dim]`.
    ///
    /// Leading dimensions are flattened for the matmuls and restored on the
    /// way out; the result has the dtype of `x`.
    pub fn delta(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims().to_vec();
        let in_dim = *dims.last().unwrap_or(&0);
        let tokens = x.elem_count() / in_dim.max(1);

        let x_2d = x
            .reshape((tokens, in_dim))?
            .to_dtype(self.lora_a.dtype())?;
        let out = x_2d
            .matmul(&self.lora_a.t()?)?
            .matmul(&self.lora_b.t()?)?;
        let out = if (self.scale - 1.0).abs() > f32::EPSILON {
            out.affine(self.scale as f64, 0.0)?
        } else {
            out
        };

        let mut out_dims = dims;
        if let Some(last) = out_dims.last_mut() {
            *last = self.output_dim();
        }
        out.reshape(out_dims)?.to_dtype(x.dtype())
    }
}

/// Plain LoRA adapter: one low-rank delta per target module of a shared layer.
///
/// Module names are the local projection names of the host layer
/// (e.g. `"gate_proj"`, `"down_proj"`, or the name of a dense projection).
/// A module without a delta passes through the frozen weights unchanged.
#[derive(Debug, Clone)]
pub struct LinearAdapter {
    /// LoRA rank shared by every module.
    pub rank: usize,
    /// Alpha parameter.
    pub alpha: f32,
    modules: HashMap<String, LoraAdapter>,
}

impl LinearAdapter {
    /// Create an adapter with no module deltas yet.
    pub fn new(rank: usize, alpha: f32) -> Self {
        Self {
            rank,
            alpha,
            modules: HashMap::new(),
        }
    }

    /// Attach the delta for a module, replacing any previous one.
    pub fn add_module(&mut self, module_name: impl Into<String>, adapter: LoraAdapter) {
        self.modules.insert(module_name.into(), adapter);
    }

    /// Builder form of [`add_module`](Self::add_module).
    pub fn with_module(mut self, module_name: impl Into<String>, adapter: LoraAdapter) -> Self {
        self.add_module(module_name, adapter);
        self
    }

    /// Delta weights for a module.
    pub fn module(&self, module_name: &str) -> Option<&LoraAdapter> {
        self.modules.get(module_name)
    }

    /// Names of the modules carrying a delta, sorted.
    pub fn module_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of modules with a delta.
    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    /// Add this adapter's delta for `module_name` to a frozen projection output.
    ///
    /// `x` is the projection input, `base` its frozen output.
    pub fn apply(&self, module_name: &str, x: &Tensor, base: Tensor) -> Result<Tensor> {
        match self.modules.get(module_name) {
            Some(lora) => base + lora.delta(x)?,
            None => Ok(base),
        }
    }

    /// Check rank and per-module shapes.
    pub fn check_shapes(&self) -> std::result::Result<(), String> {
        if self.rank == 0 {
            return Err("rank must be positive".to_string());
        }
        for (name, lora) in &self.modules {
            if lora.rank != self.rank {
                return Err(format!(
                    "module {name} has rank {}, adapter rank is {}",
                    lora.rank, self.rank
                ));
            }
            lora.check_shapes()
                .map_err(|reason| format!("module {name}: {reason}"))?;
        }
        Ok(())
    }

    /// Check every module delta against the projections of a host layer.
    ///
    /// Each module must name one of `targets` and match its input and output
    /// sizes.
    pub fn check_against(&self, targets: &[TargetModule]) -> std::result::Result<(), String> {
        for name in self.module_names() {
            let Some(target) = targets.iter().find(|t| t.name == name) else {
                return Err(format!("module {name} is not a projection of the layer"));
            };
            if let Some(lora) = self.modules.get(name) {
                if lora.input_dim() != target.in_features
                    || lora.output_dim() != target.out_features
                {
                    return Err(format!(
                        "module {name} maps {} -> {}, layer projection maps {} -> {}",
                        lora.input_dim(),
                        lora.output_dim(),
                        target.in_features,
                        target.out_features
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_lora_adapter_dimensions() {
        let device = Device::Cpu;
        let rank = 8;

        let lora_a = Tensor::zeros((rank, 512), DType::F32, &device).unwrap();
        let lora_b = Tensor::zeros((256, rank), DType::F32, &device).unwrap();

        let adapter = LoraAdapter::new(lora_a, lora_b, rank, 16.0);

        assert_eq!(adapter.input_dim(), 512);
        assert_eq!(adapter.output_dim(), 256);
        assert!((adapter.scale - 2.0).abs() < f32::EPSILON); // 16.0 / 8
        assert!(adapter.check_shapes().is_ok());
    }

    #[test]
    fn test_rslora_scaling() {
        let device = Device::Cpu;
        let lora_a = Tensor::zeros((16, 4), DType::F32, &device).unwrap();
        let lora_b = Tensor::zeros((4, 16), DType::F32, &device).unwrap();

        let adapter = LoraAdapter::new_with_rslora(lora_a, lora_b, 16, 32.0);
        // alpha / sqrt(rank) = 32 / 4
        assert!((adapter.scale - 8.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_delta_values() {
        let device = Device::Cpu;
        // x = ones [2, 4], A = ones [2, 4], B = ones [3, 2], scale = 4 / 2
        // x @ A.T = 4 per entry, @ B.T = 8 per entry, * 2 = 16
        let lora_a = Tensor::ones((2, 4), DType::F32, &device).unwrap();
        let lora_b = Tensor::ones((3, 2), DType::F32, &device).unwrap();
        let adapter = LoraAdapter::new(lora_a, lora_b, 2, 4.0);

        let x = Tensor::ones((2, 4), DType::F32, &device).unwrap();
        let delta = adapter.delta(&x).unwrap();
        assert_eq!(delta.dims(), &[2, 3]);
        let values: Vec<f32> = delta.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| (v - 16.0).abs() < 1e-5));
    }

    #[test]
    fn test_delta_keeps_leading_dims() {
        let device = Device::Cpu;
        let lora_a = Tensor::randn(0f32, 1.0, (2, 8), &device).unwrap();
        let lora_b = Tensor::randn(0f32, 1.0, (6, 2), &device).unwrap();
        let adapter = LoraAdapter::new(lora_a, lora_b, 2, 2.0);

        let x = Tensor::randn(0f32, 1.0, (3, 5, 8), &device).unwrap();
        let delta = adapter.delta(&x).unwrap();
        assert_eq!(delta.dims(), &[3, 5, 6]);
    }

    #[test]
    fn test_linear_adapter_modules() {
        let device = Device::Cpu;
        let lora_a = Tensor::zeros((8, 32), DType::F32, &device).unwrap();
        let lora_b = Tensor::zeros((64, 8), DType::F32, &device).unwrap();

        let adapter = LinearAdapter::new(8, 16.0)
            .with_module("up_proj", LoraAdapter::new(lora_a, lora_b, 8, 16.0));

        assert_eq!(adapter.num_modules(), 1);
        assert!(adapter.module("up_proj").is_some());
        assert!(adapter.module("down_proj").is_none());
        assert_eq!(adapter.module_names(), vec!["up_proj"]);
        assert!(adapter.check_shapes().is_ok());
    }

    #[test]
    fn test_apply_without_module_is_passthrough() {
        let device = Device::Cpu;
        let adapter = LinearAdapter::new(4, 8.0);
        let x = Tensor::ones((2, 3), DType::F32, &device).unwrap();
        let base = Tensor::full(7f32, (2, 5), &device).unwrap();

        let out = adapter.apply("o_proj", &x, base).unwrap();
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_check_shapes_rejects_rank_mismatch() {
        let device = Device::Cpu;
        let lora_a = Tensor::zeros((4, 16), DType::F32, &device).unwrap();
        let lora_b = Tensor::zeros((16, 4), DType::F32, &device).unwrap();
        let adapter =
            LinearAdapter::new(8, 16.0).with_module("q", LoraAdapter::new(lora_a, lora_b, 4, 16.0));
        assert!(adapter.check_shapes().is_err());

        assert!(LinearAdapter::new(0, 1.0).check_shapes().is_err());
    }

    #[test]
    fn test_check_against_layer_projections() {
        let device = Device::Cpu;
        let lora = |in_dim: usize, out_dim: usize| {
            LoraAdapter::new(
                Tensor::zeros((2, in_dim), DType::F32, &device).unwrap(),
                Tensor::zeros((out_dim, 2), DType::F32, &device).unwrap(),
                2,
                4.0,
            )
        };
        let targets = vec![
            TargetModule::new("up_proj", 8, 16),
            TargetModule::new("down_proj", 16, 8),
        ];

        let ok = LinearAdapter::new(2, 4.0)
            .with_module("up_proj", lora(8, 16))
            .with_module("down_proj", lora(16, 8));
        assert!(ok.check_against(&targets).is_ok());

        let wide = LinearAdapter::new(2, 4.0).with_module("up_proj", lora(12, 16));
        assert!(wide.check_against(&targets).unwrap_err().contains("up_proj"));

        let unknown = LinearAdapter::new(2, 4.0).with_module("q_proj", lora(8, 8));
        assert!(unknown.check_against(&targets).is_err());
    }
}
