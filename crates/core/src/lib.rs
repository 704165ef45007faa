//! Multi-adapter batch assembly and routing.
//!
//! Many LoRA adapters, and optionally per-adapter mixtures of LoRA experts,
//! share one frozen base model's forward pass. A [`batch::BatchDescriptor`]
//! says which contiguous rows of a batch belong to which adapter; each
//! [`routing::RoutingLayer`] splits its input accordingly, runs every slice
//! through its adapter's transform and reassembles the output in row order.

pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod lora;
pub mod moe;
pub mod registry;
pub mod routing;
pub mod shared;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use batch::{AdapterSlice, BatchBuilder, BatchDescriptor, BatchError, PaddingSide};
pub use config::{AdapterConfig, ConfigError, RoutingPolicy, RunConfig};
pub use dispatcher::{Dispatcher, DispatcherConfig, PendingRequest, QueueDispatcher};
pub use registry::{AdapterId, AdapterKind, AdapterRegistry, RegistryError};
pub use routing::{MultiLoraStack, RouterLogits, RoutingLayer};
pub use shared::{FrozenFeedForward, FrozenLinear, SharedLayer};
