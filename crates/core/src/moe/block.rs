//! Gated mixture of LoRA experts for one adapter.

use candle_core::{DType, Result, Tensor};
use candle_nn::Activation;
use tracing::trace;

use super::router::GateRouter;
use crate::config::{AdapterConfig, RoutingPolicy};
use crate::lora::LinearAdapter;
use crate::registry::RegistryError;

/// Callback the host layer supplies to run one expert on the tokens routed to
/// it: `(expert_index, activation, tokens) -> expert output`.
pub type ExpertTransform<'a> = dyn Fn(usize, Activation, &Tensor) -> Result<Tensor> + 'a;

/// Shape and policy of a mixture adapter.
#[derive(Debug, Clone)]
pub struct MixtureConfig {
    pub num_experts: usize,
    pub top_k: usize,
    pub policy: RoutingPolicy,
    /// Std for gate initialization when no gate is supplied.
    pub router_init_std: f32,
}

impl MixtureConfig {
    pub fn new(num_experts: usize, top_k: usize, policy: RoutingPolicy) -> Self {
        Self {
            num_experts,
            top_k,
            policy,
            router_init_std: 0.02,
        }
    }

    pub fn from_adapter_config(config: &AdapterConfig) -> Self {
        Self {
            num_experts: config.num_experts,
            top_k: config.top_k,
            policy: config.routing_policy,
            router_init_std: config.router_init_std,
        }
    }

    pub fn validate(&self, name: &str) -> std::result::Result<(), RegistryError> {
        if self.num_experts == 0 {
            return Err(RegistryError::NoExperts(name.to_string()));
        }
        if self.top_k == 0 || self.top_k > self.num_experts {
            return Err(RegistryError::InvalidTopK {
                name: name.to_string(),
                top_k: self.top_k,
                num_experts: self.num_experts,
            });
        }
        Ok(())
    }
}

/// One adapter's mixture of experts: a gate scoring experts per token and a
/// set of [`LinearAdapter`] experts.
///
/// The block never calls the shared layer itself; the routing layer hands it
/// an [`ExpertTransform`] at call time.
#[derive(Debug, Clone)]
pub struct GatedExpertBlock {
    router: GateRouter,
    experts: Vec<LinearAdapter>,
    activation: Activation,
}

impl GatedExpertBlock {
    /// Assemble a block, checking every structural constraint up front.
    ///
    /// `gate` is `[num_experts, hidden_size]` and is used as given.
    pub fn new(
        name: &str,
        config: &MixtureConfig,
        hidden_size: usize,
        gate: Tensor,
        experts: Vec<LinearAdapter>,
        activation: Activation,
    ) -> std::result::Result<Self, RegistryError> {
        config.validate(name)?;
        if experts.len() != config.num_experts {
            return Err(RegistryError::ExpertCountMismatch {
                name: name.to_string(),
                expected: config.num_experts,
                got: experts.len(),
            });
        }
        let expected = [config.num_experts, hidden_size];
        if gate.dims() != expected {
            return Err(RegistryError::GateShape {
                name: name.to_string(),
                expected: expected.to_vec(),
                got: gate.dims().to_vec(),
            });
        }
        for (idx, expert) in experts.iter().enumerate() {
            expert
                .check_shapes()
                .map_err(|reason| RegistryError::InvalidAdapter {
                    name: format!("{name} expert {idx}"),
                    reason,
                })?;
        }
        Ok(Self {
            router: GateRouter::new(gate, config.top_k, config.policy)?,
            experts,
            activation,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    pub fn experts_per_token(&self) -> usize {
        self.router.experts_per_token()
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.router.policy()
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn gate_weight(&self) -> &Tensor {
        self.router.weight()
    }

    pub fn experts(&self) -> &[LinearAdapter] {
        &self.experts
    }

    pub fn expert(&self, idx: usize) -> Result<&LinearAdapter> {
        self.experts.get(idx).ok_or_else(|| {
            candle_core::Error::Msg(format!(
                "expert {idx} out of range for {} experts",
                self.experts.len()
            ))
        })
    }

    /// Route `hidden_states` (`[..., hidden_size]`) through the experts.
    ///
    /// Tokens are grouped per selected expert, each group goes through
    /// `expert_transform` once, and weighted results are scattered back with
    /// `index_add`. Returns the combined output and, when `output_router_logits`
    /// is set, the raw gate logits `[num_tokens, num_experts]`.
    pub fn forward(
        &self,
        expert_transform: &ExpertTransform<'_>,
        hidden_states: &Tensor,
        output_router_logits: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let orig_shape = hidden_states.dims().to_vec();
        let hidden_size = *orig_shape.last().ok_or_else(|| {
            candle_core::Error::Msg("Tensor must have at least 1 dimension".to_string())
        })?;
        let num_tokens: usize = orig_shape[..orig_shape.len() - 1].iter().product();
        if num_tokens == 0 {
            candle_core::bail!("gated expert block called with no tokens");
        }
        let flat_hidden = hidden_states.reshape((num_tokens, hidden_size))?;

        let router_logits = self.router.logits(&flat_hidden)?;
        let (routing_weights, expert_indices) = self.router.select(&router_logits)?;

        let per_token = expert_indices.dim(1)?;
        let expert_indices_vec: Vec<u32> = expert_indices.flatten_all()?.to_vec1()?;
        let routing_weights_vec: Vec<f32> = routing_weights
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1()?;

        let mut expert_tokens: Vec<Vec<(u32, f32)>> = vec![Vec::new(); self.experts.len()];
        for token_idx in 0..num_tokens {
            for k in 0..per_token {
                let flat_idx = token_idx * per_token + k;
                let expert_id = expert_indices_vec[flat_idx] as usize;
                expert_tokens[expert_id].push((token_idx as u32, routing_weights_vec[flat_idx]));
            }
        }

        let device = hidden_states.device();
        let dtype = hidden_states.dtype();
        let mut output: Option<Tensor> = None;
        for (expert_id, tokens) in expert_tokens.iter().enumerate() {
            if tokens.is_empty() {
                continue;
            }
            trace!(expert_id, tokens = tokens.len(), "expert dispatch");

            let indices: Vec<u32> = tokens.iter().map(|&(idx, _)| idx).collect();
            let index_tensor = Tensor::from_vec(indices, tokens.len(), device)?;
            let expert_input = flat_hidden.index_select(&index_tensor, 0)?;
            let expert_output = expert_transform(expert_id, self.activation, &expert_input)?;

            let weights: Vec<f32> = tokens.iter().map(|&(_, w)| w).collect();
            let weights = Tensor::from_vec(weights, (tokens.len(), 1), device)?.to_dtype(dtype)?;
            let weighted_output = expert_output.broadcast_mul(&weights)?;

            let acc = match output.take() {
                Some(acc) => acc,
                None => Tensor::zeros((num_tokens, weighted_output.dim(1)?), dtype, device)?,
            };
            output = Some(acc.index_add(&index_tensor, &weighted_output, 0)?);
        }

        let output = output.ok_or_else(|| {
            candle_core::Error::Msg("no expert received any token".to_string())
        })?;
        let mut out_shape = orig_shape;
        if let Some(last) = out_shape.last_mut() {
            *last = output.dim(1)?;
        }
        let output = output.reshape(out_shape)?;

        Ok((output, output_router_logits.then_some(router_logits)))
    }
}
