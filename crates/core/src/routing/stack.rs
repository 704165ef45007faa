use candle_core::{DType, Device, Result, Tensor};
use tracing::info;

use super::{RouterLogits, RoutingLayer};
use crate::batch::BatchDescriptor;
use crate::config::AdapterConfig;
use crate::lora::{LinearAdapter, TargetModule, WeightInit};
use crate::moe::{GatedExpertBlock, MixtureConfig};
use crate::registry::{AdapterKind, RegistryError};
use crate::shared::SharedLayer;

/// Ordered stack of routing layers sharing one descriptor per forward pass.
///
/// Adapters are registered on every layer at once, with freshly initialized
/// weights, and unloaded from every layer at once.
pub struct MultiLoraStack<S: SharedLayer> {
    layers: Vec<RoutingLayer<S>>,
    init: WeightInit,
}

impl<S: SharedLayer> MultiLoraStack<S> {
    /// `seed` makes adapter initialization reproducible.
    pub fn new(shared: Vec<S>, seed: Option<u64>, device: &Device, dtype: DType) -> Self {
        Self {
            layers: shared.into_iter().map(RoutingLayer::new).collect(),
            init: WeightInit::new(seed, device, dtype),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[RoutingLayer<S>] {
        &self.layers
    }

    /// Adapters registered on the stack, sorted.
    pub fn adapter_names(&self) -> Vec<&str> {
        self.layers
            .first()
            .map(|l| l.registry().names())
            .unwrap_or_default()
    }

    /// Initialize `config` on every layer.
    ///
    /// `gates`, when given, holds one initial gate tensor per layer
    /// (`[num_experts, hidden_size]`), copied instead of drawn at random.
    /// Only mixture adapters accept them.
    /// Nothing is registered unless every layer accepts the adapter.
    pub fn register_adapter(
        &mut self,
        config: &AdapterConfig,
        gates: Option<&[Tensor]>,
    ) -> std::result::Result<(), RegistryError> {
        config.validate()?;
        if self.layers.iter().any(|l| l.registry().contains(&config.name)) {
            return Err(RegistryError::NameConflict(config.name.clone()));
        }
        if let Some(gates) = gates {
            if !config.is_mixture() {
                return Err(RegistryError::InvalidAdapter {
                    name: config.name.clone(),
                    reason: "initial gates given for an adapter without experts".to_string(),
                });
            }
            if gates.len() != self.layers.len() {
                return Err(RegistryError::InvalidAdapter {
                    name: config.name.clone(),
                    reason: format!(
                        "{} initial gates for {} layers",
                        gates.len(),
                        self.layers.len()
                    ),
                });
            }
        }

        let init = &mut self.init;
        let mut kinds = Vec::with_capacity(self.layers.len());
        for (idx, layer) in self.layers.iter().enumerate() {
            let shared = layer.shared();
            let modules = select_modules(shared.target_modules(), &config.target_modules);
            if modules.is_empty() {
                return Err(RegistryError::InvalidAdapter {
                    name: config.name.clone(),
                    reason: format!("no target module matches {:?}", config.target_modules),
                });
            }
            let kind = if config.is_mixture() {
                let mixture = MixtureConfig::from_adapter_config(config);
                let gate = match gates {
                    Some(gates) => gates[idx].clone(),
                    None => init.normal(
                        (mixture.num_experts, shared.hidden_size()),
                        mixture.router_init_std,
                    )?,
                };
                let experts = (0..mixture.num_experts)
                    .map(|_| new_linear(init, &modules, config))
                    .collect::<Result<Vec<_>>>()?;
                let activation = config.activation()?.unwrap_or_else(|| shared.activation());
                AdapterKind::Mixture(GatedExpertBlock::new(
                    &config.name,
                    &mixture,
                    shared.hidden_size(),
                    gate,
                    experts,
                    activation,
                )?)
            } else {
                AdapterKind::Linear(new_linear(init, &modules, config)?)
            };
            kinds.push(kind);
        }

        for (layer, kind) in self.layers.iter_mut().zip(kinds) {
            layer.register(config.name.clone(), kind)?;
        }
        info!(
            adapter = %config.name,
            layers = self.layers.len(),
            mixture = config.is_mixture(),
            "adapter initialized"
        );
        Ok(())
    }

    /// Drop an adapter from every layer. Returns whether it was registered.
    pub fn unload_adapter(&mut self, name: &str) -> bool {
        let mut found = false;
        for layer in &mut self.layers {
            found |= layer.unload(name).is_some();
        }
        found
    }

    /// Run every layer in order; returns the final output and the router
    /// logits of each layer.
    pub fn forward(
        &self,
        input: &Tensor,
        batch: &BatchDescriptor,
    ) -> Result<(Tensor, Vec<RouterLogits>)> {
        let mut hidden = input.clone();
        let mut all_logits = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (out, logits) = layer.route(&hidden, batch)?;
            hidden = out;
            all_logits.push(logits);
        }
        Ok((hidden, all_logits))
    }
}

/// Gate logits one adapter produced across layers, for the auxiliary losses.
///
/// Gathers every slice bound to `adapter_name` in every layer.
pub fn adapter_router_logits(
    batch: &BatchDescriptor,
    per_layer: &[RouterLogits],
    adapter_name: &str,
) -> Vec<Tensor> {
    per_layer
        .iter()
        .flat_map(|layer| {
            batch
                .slices()
                .iter()
                .zip(layer)
                .filter(|(slice, _)| slice.adapter_name == adapter_name)
                .filter_map(|(_, logits)| logits.clone())
        })
        .collect()
}

fn new_linear(
    init: &mut WeightInit,
    modules: &[TargetModule],
    config: &AdapterConfig,
) -> Result<LinearAdapter> {
    init.linear_adapter(modules, config.rank, config.alpha, config.use_rslora)
}

fn select_modules(available: Vec<TargetModule>, wanted: &[String]) -> Vec<TargetModule> {
    if wanted.is_empty() {
        return available;
    }
    available
        .into_iter()
        .filter(|m| wanted.iter().any(|w| w == &m.name))
        .collect()
}
