//! Adapter registry: name to routing strategy.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::lora::LinearAdapter;
use crate::moe::GatedExpertBlock;

/// Errors raised while registering an adapter.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("adapter name already in use: {0}")]
    NameConflict(String),
    #[error("adapter {0}: a mixture needs at least one expert")]
    NoExperts(String),
    #[error("adapter {name}: top_k {top_k} is outside 1..={num_experts}")]
    InvalidTopK {
        name: String,
        top_k: usize,
        num_experts: usize,
    },
    #[error("adapter {name}: expected {expected} experts, got {got}")]
    ExpertCountMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("adapter {name}: gate weight has shape {got:?}, expected {expected:?}")]
    GateShape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("adapter {name}: {reason}")]
    InvalidAdapter { name: String, reason: String },
    #[error("invalid adapter config: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// How rows bound to an adapter are transformed.
#[derive(Debug, Clone)]
pub enum AdapterKind {
    /// Additive low-rank deltas on the shared layer's projections.
    Linear(LinearAdapter),
    /// Gated mixture of LoRA experts.
    Mixture(GatedExpertBlock),
}

impl AdapterKind {
    pub fn is_mixture(&self) -> bool {
        matches!(self, AdapterKind::Mixture(_))
    }

    fn label(&self) -> &'static str {
        match self {
            AdapterKind::Linear(_) => "linear",
            AdapterKind::Mixture(_) => "mixture",
        }
    }

    fn check(&self, name: &str) -> Result<(), RegistryError> {
        match self {
            AdapterKind::Linear(adapter) => {
                adapter
                    .check_shapes()
                    .map_err(|reason| RegistryError::InvalidAdapter {
                        name: name.to_string(),
                        reason,
                    })
            }
            // Blocks are checked when constructed.
            AdapterKind::Mixture(_) => Ok(()),
        }
    }
}

/// Integer handle handed out at registration.
pub type AdapterId = u32;

#[derive(Debug)]
struct Entry {
    id: AdapterId,
    kind: Arc<AdapterKind>,
}

/// Table of adapters owned by one routing layer.
///
/// Entries are `Arc`s: unloading only affects later lookups, never a route
/// call that already holds a handle.
#[derive(Debug)]
pub struct AdapterRegistry {
    entries: HashMap<String, Entry>,
    id_to_name: HashMap<AdapterId, String>,
    next_id: AdapterId,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            id_to_name: HashMap::new(),
            next_id: 1,
        }
    }

    /// Register an adapter under a unique name and return its handle.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        kind: AdapterKind,
    ) -> Result<AdapterId, RegistryError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::NameConflict(name));
        }
        kind.check(&name)?;

        let id = self.next_id;
        self.next_id += 1;
        info!(adapter = %name, id, kind = kind.label(), "registered adapter");

        self.id_to_name.insert(id, name.clone());
        self.entries.insert(
            name,
            Entry {
                id,
                kind: Arc::new(kind),
            },
        );
        Ok(id)
    }

    /// Drop an adapter. Returns its entry if it was registered.
    pub fn unload(&mut self, name: &str) -> Option<Arc<AdapterKind>> {
        let entry = self.entries.remove(name)?;
        self.id_to_name.remove(&entry.id);
        info!(adapter = %name, id = entry.id, "unloaded adapter");
        Some(entry.kind)
    }

    pub fn get(&self, name: &str) -> Option<Arc<AdapterKind>> {
        self.entries.get(name).map(|e| Arc::clone(&e.kind))
    }

    pub fn get_by_id(&self, id: AdapterId) -> Option<Arc<AdapterKind>> {
        self.id_to_name.get(&id).and_then(|name| self.get(name))
    }

    pub fn id_of(&self, name: &str) -> Option<AdapterId> {
        self.entries.get(name).map(|e| e.id)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingPolicy;
    use crate::lora::LoraAdapter;
    use crate::moe::MixtureConfig;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::Activation;

    fn linear(rank: usize) -> AdapterKind {
        let device = Device::Cpu;
        let lora_a = Tensor::zeros((rank, 8), DType::F32, &device).unwrap();
        let lora_b = Tensor::zeros((8, rank), DType::F32, &device).unwrap();
        AdapterKind::Linear(
            LinearAdapter::new(rank, 16.0).with_module("proj", LoraAdapter::new(lora_a, lora_b, rank, 16.0)),
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.is_empty());

        let id_a = registry.register("a", linear(4)).unwrap();
        let id_b = registry.register("b", linear(2)).unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert_eq!(registry.id_of("b"), Some(id_b));
        assert!(registry.get_by_id(id_a).is_some());
        assert!(registry.get("missing").is_none());
        assert!(!registry.get("a").unwrap().is_mixture());
    }

    #[test]
    fn test_name_conflict() {
        let mut registry = AdapterRegistry::new();
        registry.register("a", linear(4)).unwrap();
        let err = registry.register("a", linear(4)).unwrap_err();
        assert!(matches!(err, RegistryError::NameConflict(name) if name == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_rank_rejected() {
        let mut registry = AdapterRegistry::new();
        let err = registry
            .register("zero", AdapterKind::Linear(LinearAdapter::new(0, 1.0)))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidAdapter { .. }));
        assert!(!registry.contains("zero"));
    }

    #[test]
    fn test_unload_keeps_handles_alive() {
        let mut registry = AdapterRegistry::new();
        let id = registry.register("a", linear(4)).unwrap();
        let handle = registry.get("a").unwrap();

        let removed = registry.unload("a").unwrap();
        assert!(Arc::ptr_eq(&handle, &removed));
        assert!(registry.get("a").is_none());
        assert!(registry.get_by_id(id).is_none());
        assert!(registry.unload("a").is_none());

        // The handle taken before unload still works.
        assert!(matches!(&*handle, AdapterKind::Linear(a) if a.rank == 4));
    }

    #[test]
    fn test_ids_not_reused() {
        let mut registry = AdapterRegistry::new();
        let first = registry.register("a", linear(4)).unwrap();
        registry.unload("a");
        let second = registry.register("a", linear(4)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_register_mixture() {
        let device = Device::Cpu;
        let config = MixtureConfig::new(2, 1, RoutingPolicy::Switch);
        let gate = Tensor::zeros((2, 8), DType::F32, &device).unwrap();
        let experts = vec![LinearAdapter::new(4, 8.0), LinearAdapter::new(4, 8.0)];
        let block =
            GatedExpertBlock::new("mix", &config, 8, gate, experts, Activation::Silu).unwrap();

        let mut registry = AdapterRegistry::new();
        registry.register("mix", AdapterKind::Mixture(block)).unwrap();
        assert!(registry.get("mix").unwrap().is_mixture());
    }
}
