//! Auxiliary router losses computed from collected gate logits.
//!
//! Both losses take the logits one mixture adapter reported across layers
//! (each `[num_tokens, num_experts]`) and concatenate them along the token
//! dimension before reducing.

use candle_core::{DType, Result, Tensor, D};

use super::router::top_k_with_indices;

fn concat_logits(router_logits: &[Tensor]) -> Result<Tensor> {
    if router_logits.is_empty() {
        candle_core::bail!("no router logits to compute a loss from");
    }
    let flat = router_logits
        .iter()
        .map(|t| {
            let n = t.dim(D::Minus1)?;
            t.reshape(((), n))?.to_dtype(DType::F32)
        })
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&flat, 0)
}

/// Switch/Mixtral load balancing loss: `num_experts * sum_i(f_i * p_i)`.
///
/// `f_i` is the fraction of top-k selections that went to expert `i` and
/// `p_i` the mean softmax probability of expert `i`. Perfectly uniform
/// routing gives 1.0. Returns an f32 scalar.
pub fn load_balancing_loss(
    router_logits: &[Tensor],
    num_experts: usize,
    top_k: usize,
) -> Result<Tensor> {
    let logits = concat_logits(router_logits)?;
    if logits.dim(1)? != num_experts {
        candle_core::bail!(
            "router logits have {} experts, expected {num_experts}",
            logits.dim(1)?
        );
    }
    let probs = candle_nn::ops::softmax_last_dim(&logits)?;
    let (_, selected) = top_k_with_indices(&probs, top_k)?;

    let selected = selected.to_vec2::<u32>()?;
    let mut expert_counts = vec![0.0f32; num_experts];
    for &expert_idx in selected.iter().flatten() {
        expert_counts[expert_idx as usize] += 1.0;
    }
    let total_selections = selected.len() * selected.first().map_or(1, Vec::len);
    let f_i = Tensor::from_vec(
        expert_counts
            .iter()
            .map(|c| c / total_selections as f32)
            .collect::<Vec<_>>(),
        num_experts,
        logits.device(),
    )?;

    let p_i = probs.mean(0)?;
    (f_i * p_i)?.sum_all()? * num_experts as f64
}

/// Router z-loss: mean over tokens of `logsumexp(logits)^2`.
pub fn router_z_loss(router_logits: &[Tensor]) -> Result<Tensor> {
    let logits = concat_logits(router_logits)?;
    let max_val = logits.max_keepdim(D::Minus1)?;
    let sum_exp = logits.broadcast_sub(&max_val)?.exp()?.sum_keepdim(D::Minus1)?;
    let log_sum_exp = (max_val + sum_exp.log()?)?;
    log_sum_exp.sqr()?.mean_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_uniform_routing_balances_to_one() {
        let device = Device::Cpu;
        // Each token strongly prefers a different expert; probabilities are
        // symmetric, so f_i == p_i == 1/4.
        let logits = Tensor::new(
            &[
                [5f32, 0.0, 0.0, 0.0],
                [0.0, 5.0, 0.0, 0.0],
                [0.0, 0.0, 5.0, 0.0],
                [0.0, 0.0, 0.0, 5.0],
            ],
            &device,
        )
        .unwrap();
        let loss = load_balancing_loss(&[logits], 4, 1)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 1.0).abs() < 1e-5, "loss {loss}");
    }

    #[test]
    fn test_collapsed_routing_is_penalized() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[5f32, 0.0], [5.0, 0.0], [5.0, 0.0]], &device).unwrap();
        let loss = load_balancing_loss(&[logits.clone(), logits], 2, 1)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss > 1.5, "loss {loss}");
    }

    #[test]
    fn test_expert_count_mismatch() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        assert!(load_balancing_loss(&[logits], 4, 1).is_err());
        assert!(load_balancing_loss(&[], 4, 1).is_err());
    }

    #[test]
    fn test_z_loss_value() {
        let device = Device::Cpu;
        // logsumexp([0, 0]) = ln 2
        let logits = Tensor::zeros((3, 2), DType::F32, &device).unwrap();
        let loss = router_z_loss(&[logits]).unwrap().to_scalar::<f32>().unwrap();
        let expected = std::f32::consts::LN_2.powi(2);
        assert!((loss - expected).abs() < 1e-6);
    }
}
