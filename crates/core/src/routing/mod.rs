//! Per-layer multi-adapter routing.
//!
//! [`RoutingLayer`] owns one shared layer and the adapters registered on it;
//! [`MultiLoraStack`] chains several of them and manages adapter lifecycle
//! across the whole stack.

mod layer;
mod stack;

pub use layer::{RouterLogits, RoutingLayer};
pub use stack::{adapter_router_logits, MultiLoraStack};
