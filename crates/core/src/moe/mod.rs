//! Mixture-of-LoRA-experts adapters.
//!
//! A [`GatedExpertBlock`] scores its experts per token with a linear gate,
//! selects experts according to its [`RoutingPolicy`](crate::config::RoutingPolicy)
//! and invokes them through a host-supplied [`ExpertTransform`]. The
//! [`aux_loss`] helpers turn collected gate logits into balancing losses.

pub mod aux_loss;
mod block;
mod router;

pub use block::{ExpertTransform, GatedExpertBlock, MixtureConfig};
pub use router::GateRouter;
