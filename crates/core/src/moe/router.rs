//! Gate scoring and expert selection.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Linear, Module};

use crate::config::RoutingPolicy;

/// Linear gate over the hidden dimension plus a selection policy.
#[derive(Debug, Clone)]
pub struct GateRouter {
    gate: Linear,
    num_experts: usize,
    top_k: usize,
    policy: RoutingPolicy,
}

impl GateRouter {
    /// `weight` is `[num_experts, hidden_size]`.
    pub fn new(weight: Tensor, top_k: usize, policy: RoutingPolicy) -> Result<Self> {
        let num_experts = weight.dim(0)?;
        Ok(Self {
            gate: Linear::new(weight, None),
            num_experts,
            top_k,
            policy,
        })
    }

    pub fn weight(&self) -> &Tensor {
        self.gate.weight()
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    /// Experts each token is sent to under the policy.
    pub fn experts_per_token(&self) -> usize {
        match self.policy {
            RoutingPolicy::TopK => self.top_k,
            RoutingPolicy::Dense => self.num_experts,
            RoutingPolicy::Switch => 1,
        }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// Raw gate logits `[num_tokens, num_experts]`.
    pub fn logits(&self, hidden_states: &Tensor) -> Result<Tensor> {
        self.gate.forward(hidden_states)
    }

    /// Turn logits into `(weights, expert_indices)`, both
    /// `[num_tokens, experts_per_token]`. Weights are f32.
    pub fn select(&self, logits: &Tensor) -> Result<(Tensor, Tensor)> {
        let probs = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
        match self.policy {
            RoutingPolicy::TopK => {
                let (weights, indices) = top_k_with_indices(&probs, self.top_k)?;
                let sum = weights.sum_keepdim(D::Minus1)?;
                Ok((weights.broadcast_div(&sum)?, indices))
            }
            RoutingPolicy::Switch => top_k_with_indices(&probs, 1),
            RoutingPolicy::Dense => {
                let num_tokens = probs.dim(0)?;
                let indices = Tensor::arange(0u32, self.num_experts as u32, probs.device())?
                    .unsqueeze(0)?
                    .broadcast_as((num_tokens, self.num_experts))?
                    .contiguous()?;
                Ok((probs, indices))
            }
        }
    }
}

/// Get top-k values and their indices along the last dimension.
///
/// # Returns
/// * `values` - Top-k values of shape `[..., k]`, descending
/// * `indices` - Indices of those values, shape `[..., k]`
pub(crate) fn top_k_with_indices(tensor: &Tensor, k: usize) -> Result<(Tensor, Tensor)> {
    let dim = tensor.dims().len() - 1;
    let n = tensor.dim(dim)?;
    let k = k.min(n);

    let sorted_indices = tensor.arg_sort_last_dim(false)?;
    let top_k_indices = sorted_indices.narrow(dim, 0, k)?.contiguous()?;
    let top_k_values = tensor.contiguous()?.gather(&top_k_indices, dim)?;

    Ok((top_k_values, top_k_indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_top_k_with_indices() {
        let device = Device::Cpu;
        let tensor = Tensor::new(&[[0.1f32, 0.4, 0.2, 0.3]], &device).unwrap();

        let (values, indices) = top_k_with_indices(&tensor, 2).unwrap();

        let values_vec: Vec<f32> = values.flatten_all().unwrap().to_vec1().unwrap();
        let indices_vec: Vec<u32> = indices.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(indices_vec, vec![1, 3]);
        assert!((values_vec[0] - 0.4).abs() < 1e-6);
        assert!((values_vec[1] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_top_k_clamped_to_width() {
        let device = Device::Cpu;
        let tensor = Tensor::new(&[[0.1f32, 0.9]], &device).unwrap();
        let (values, indices) = top_k_with_indices(&tensor, 5).unwrap();
        let values_vec: Vec<f32> = values.flatten_all().unwrap().to_vec1().unwrap();
        let indices_vec: Vec<u32> = indices.flatten_all().unwrap().to_vec1().unwrap();
        // Values follow the sorted indices.
        assert_eq!(indices_vec, vec![1, 0]);
        assert_eq!(values_vec, vec![0.9, 0.1]);
    }

    fn router(policy: RoutingPolicy, top_k: usize) -> GateRouter {
        let device = Device::Cpu;
        // Identity gate over 3 experts: logits equal the input.
        let weight =
            Tensor::new(&[[1f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]], &device).unwrap();
        GateRouter::new(weight, top_k, policy).unwrap()
    }

    #[test]
    fn test_top_k_weights_renormalized() {
        let r = router(RoutingPolicy::TopK, 2);
        let x = Tensor::new(&[[1.0f32, 3.0, 2.0], [0.0, 0.0, 5.0]], &Device::Cpu).unwrap();
        let (weights, indices) = r.select(&r.logits(&x).unwrap()).unwrap();

        assert_eq!(weights.dims(), &[2, 2]);
        let idx: Vec<Vec<u32>> = indices.to_vec2().unwrap();
        assert_eq!(idx[0], vec![1, 2]);
        assert_eq!(idx[1][0], 2);
        for row in weights.to_vec2::<f32>().unwrap() {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_switch_keeps_raw_probability() {
        let r = router(RoutingPolicy::Switch, 2);
        assert_eq!(r.experts_per_token(), 1);
        let x = Tensor::new(&[[0.0f32, 0.0, 0.0]], &Device::Cpu).unwrap();
        let (weights, indices) = r.select(&r.logits(&x).unwrap()).unwrap();

        assert_eq!(indices.dims(), &[1, 1]);
        let w: Vec<f32> = weights.flatten_all().unwrap().to_vec1().unwrap();
        // Uniform logits: the chosen expert keeps probability 1/3.
        assert!((w[0] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_dense_uses_all_experts() {
        let r = router(RoutingPolicy::Dense, 1);
        assert_eq!(r.experts_per_token(), 3);
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        let (weights, indices) = r.select(&r.logits(&x).unwrap()).unwrap();

        let idx: Vec<Vec<u32>> = indices.to_vec2().unwrap();
        assert_eq!(idx[0], vec![0, 1, 2]);
        let w: Vec<f32> = weights.flatten_all().unwrap().to_vec1().unwrap();
        assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(w[2] > w[1] && w[1] > w[0]);
    }
}
