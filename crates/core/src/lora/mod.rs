//! LoRA (Low-Rank Adaptation) primitives.
//!
//! A [`LinearAdapter`] carries one low-rank delta per target projection of a
//! shared layer; [`WeightInit`] creates fresh adapters and gate weights.

mod init;
mod types;

pub use init::{TargetModule, WeightInit};
pub use types::{LinearAdapter, LoraAdapter};
