use std::sync::Arc;

use candle_core::{Result, Tensor};
use candle_nn::Activation;
use tracing::{debug, trace};

use crate::batch::BatchDescriptor;
use crate::registry::{AdapterId, AdapterKind, AdapterRegistry, RegistryError};
use crate::shared::SharedLayer;

/// Per-slice router logits, in descriptor slice order.
///
/// Empty unless the batch asked for logits; then one entry per slice, `Some`
/// only for slices served by a mixture adapter.
pub type RouterLogits = Vec<Option<Tensor>>;

/// One shared layer plus the adapters registered on it.
///
/// `route` splits the input by the descriptor's slices, runs each slice
/// through its adapter's transform and scatters the results back into a
/// single output in the original row order.
pub struct RoutingLayer<S: SharedLayer> {
    shared: S,
    registry: AdapterRegistry,
}

impl<S: SharedLayer> RoutingLayer<S> {
    pub fn new(shared: S) -> Self {
        Self {
            shared,
            registry: AdapterRegistry::new(),
        }
    }

    pub fn shared(&self) -> &S {
        &self.shared
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Register an adapter after checking it against the shared layer.
    ///
    /// Every module delta must match a projection of the layer; a mixture's
    /// gate must score the layer's hidden size. Shape problems are reported
    /// here, never at routing time.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        kind: AdapterKind,
    ) -> std::result::Result<AdapterId, RegistryError> {
        let name = name.into();
        let targets = self.shared.target_modules();
        match &kind {
            AdapterKind::Linear(adapter) => {
                adapter
                    .check_against(&targets)
                    .map_err(|reason| RegistryError::InvalidAdapter {
                        name: name.clone(),
                        reason,
                    })?;
            }
            AdapterKind::Mixture(block) => {
                let expected = [block.num_experts(), self.shared.hidden_size()];
                if block.gate_weight().dims() != expected {
                    return Err(RegistryError::GateShape {
                        name,
                        expected: expected.to_vec(),
                        got: block.gate_weight().dims().to_vec(),
                    });
                }
                for (idx, expert) in block.experts().iter().enumerate() {
                    expert
                        .check_against(&targets)
                        .map_err(|reason| RegistryError::InvalidAdapter {
                            name: format!("{name} expert {idx}"),
                            reason,
                        })?;
                }
            }
        }
        self.registry.register(name, kind)
    }

    /// Drop an adapter. Returns its entry if it was registered.
    pub fn unload(&mut self, name: &str) -> Option<Arc<AdapterKind>> {
        self.registry.unload(name)
    }

    /// Transform `input` (`[total_rows, ..., hidden]`) according to `batch`.
    ///
    /// The output keeps the input's row count and order; its trailing
    /// dimension is the shared layer's output size.
    pub fn route(&self, input: &Tensor, batch: &BatchDescriptor) -> Result<(Tensor, RouterLogits)> {
        batch
            .validate()
            .map_err(|e| candle_core::Error::Msg(format!("rejected batch: {e}")))?;
        let total_rows = input.dim(0)?;
        if total_rows != batch.total_rows() {
            candle_core::bail!(
                "input has {total_rows} rows but the batch describes {}",
                batch.total_rows()
            );
        }

        if self.registry.is_empty() {
            trace!("no adapters registered, base forward only");
            return Ok((self.shared.base_forward(input)?, Vec::new()));
        }

        let mut out_shape = input.dims().to_vec();
        if let Some(last) = out_shape.last_mut() {
            *last = self.shared.output_size();
        }
        let mut output = Tensor::zeros(out_shape, input.dtype(), input.device())?;

        let slices = batch.slices();
        let mut router_logits: RouterLogits = if batch.collect_router_logits {
            vec![None; slices.len()]
        } else {
            Vec::new()
        };

        for (idx, slice) in slices.iter().enumerate() {
            if slice.is_empty() {
                continue;
            }
            let rows = input.narrow(0, slice.start, slice.len())?;
            let adapter = self.registry.get(&slice.adapter_name);
            trace!(
                adapter = %slice.adapter_name,
                start = slice.start,
                end = slice.end,
                known = adapter.is_some(),
                "routing slice"
            );

            let slice_output = match adapter.as_deref() {
                Some(AdapterKind::Linear(lora)) => {
                    self.shared
                        .adapter_forward(lora, self.shared.activation(), &rows)?
                }
                Some(AdapterKind::Mixture(block)) => {
                    let expert_transform = |expert_idx: usize, act: Activation, data: &Tensor| {
                        self.shared.adapter_forward(block.expert(expert_idx)?, act, data)
                    };
                    let (out, logits) =
                        block.forward(&expert_transform, &rows, batch.collect_router_logits)?;
                    if let Some(logits) = logits {
                        router_logits[idx] = Some(logits);
                    }
                    out
                }
                None => self.shared.base_forward(&rows)?,
            };

            let row_index =
                Tensor::arange(slice.start as u32, slice.end as u32, input.device())?;
            output = output.index_add(&row_index, &slice_output.to_dtype(output.dtype())?, 0)?;
        }

        debug!(
            rows = total_rows,
            slices = slices.len(),
            adapters = self.registry.len(),
            "routed batch"
        );

        if batch.is_inference {
            output = output.detach();
            for logits in router_logits.iter_mut().flatten() {
                *logits = logits.detach();
            }
        }
        Ok((output, router_logits))
    }
}
