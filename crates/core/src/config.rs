//! Run and adapter configuration.
//!
//! The run file is JSON:
//!
//! ```json
//! {
//!   "cutoff_len": 256,
//!   "max_rows": 16,
//!   "lora": [
//!     { "name": "alpaca", "r": 8, "alpha": 16 },
//!     { "name": "mixlora", "r": 8, "alpha": 16, "num_experts": 8, "top_k": 2 }
//!   ]
//! }
//! ```
//!
//! Unknown keys are ignored at every level.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use candle_nn::Activation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::PaddingSide;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("adapter name appears more than once: {0}")]
    DuplicateAdapter(String),
}

/// How a mixture adapter turns gate probabilities into expert weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Softmax, keep the `top_k` best experts, renormalize their weights.
    #[default]
    TopK,
    /// Softmax over all experts; every expert sees every token.
    Dense,
    /// Single best expert weighted by its softmax probability.
    Switch,
}

/// Declarative description of one adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub name: String,

    /// LoRA rank.
    #[serde(alias = "r")]
    pub rank: usize,

    #[serde(alias = "lora_alpha")]
    pub alpha: f32,

    /// 0 means a plain LoRA adapter; otherwise a gated mixture of experts.
    #[serde(default)]
    pub num_experts: usize,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default)]
    pub routing_policy: RoutingPolicy,

    /// Std of the normal distribution gate weights are drawn from.
    #[serde(default = "default_router_init_std", alias = "router_init_range")]
    pub router_init_std: f32,

    /// Projections to adapt. Empty means every projection of the layer.
    #[serde(default)]
    pub target_modules: Vec<String>,

    /// Expert activation (mixtures only). Defaults to the layer's own.
    #[serde(default)]
    pub act_fn: Option<String>,

    #[serde(default)]
    pub use_rslora: bool,

    #[serde(default)]
    pub padding_side: PaddingSide,

    /// Rows this adapter may contribute to one batch.
    #[serde(default = "default_micro_batch_size", alias = "batch_size")]
    pub micro_batch_size: usize,
}

fn default_top_k() -> usize {
    2
}

fn default_router_init_std() -> f32 {
    0.02
}

fn default_micro_batch_size() -> usize {
    4
}

impl AdapterConfig {
    /// Plain LoRA adapter config with defaults for everything else.
    pub fn linear(name: impl Into<String>, rank: usize, alpha: f32) -> Self {
        Self {
            name: name.into(),
            rank,
            alpha,
            num_experts: 0,
            top_k: default_top_k(),
            routing_policy: RoutingPolicy::default(),
            router_init_std: default_router_init_std(),
            target_modules: Vec::new(),
            act_fn: None,
            use_rslora: false,
            padding_side: PaddingSide::default(),
            micro_batch_size: default_micro_batch_size(),
        }
    }

    /// Mixture adapter config with defaults for everything else.
    pub fn mixture(
        name: impl Into<String>,
        rank: usize,
        alpha: f32,
        num_experts: usize,
        top_k: usize,
        routing_policy: RoutingPolicy,
    ) -> Self {
        Self {
            num_experts,
            top_k,
            routing_policy,
            ..Self::linear(name, rank, alpha)
        }
    }

    pub fn is_mixture(&self) -> bool {
        self.num_experts > 0
    }

    /// Compute the LoRA scaling factor.
    ///
    /// For standard LoRA: scale = alpha / rank
    /// For rsLoRA: scale = alpha / sqrt(rank)
    pub fn scaling(&self) -> f32 {
        if self.use_rslora {
            self.alpha / (self.rank as f32).sqrt()
        } else {
            self.alpha / self.rank as f32
        }
    }

    /// Parsed expert activation, if one is configured.
    pub fn activation(&self) -> Result<Option<Activation>, ConfigError> {
        self.act_fn.as_deref().map(parse_activation).transpose()
    }

    /// Field-level checks that do not need a model.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: String| ConfigError::InvalidField {
            field: format!("{}.{}", self.name, field),
            reason,
        };
        if self.name.is_empty() {
            return Err(ConfigError::InvalidField {
                field: "name".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.rank == 0 {
            return Err(invalid("rank", "must be positive".to_string()));
        }
        if self.micro_batch_size == 0 {
            return Err(invalid("micro_batch_size", "must be positive".to_string()));
        }
        if self.is_mixture() && (self.top_k == 0 || self.top_k > self.num_experts) {
            return Err(invalid(
                "top_k",
                format!("{} is outside 1..={}", self.top_k, self.num_experts),
            ));
        }
        if !(self.router_init_std.is_finite() && self.router_init_std >= 0.0) {
            return Err(invalid(
                "router_init_std",
                format!("{} is not a valid std", self.router_init_std),
            ));
        }
        self.activation()?;
        Ok(())
    }
}

/// Map an activation name to its candle implementation.
pub fn parse_activation(name: &str) -> Result<Activation, ConfigError> {
    match name.to_ascii_lowercase().as_str() {
        "silu" | "swish" => Ok(Activation::Silu),
        "gelu" => Ok(Activation::Gelu),
        "gelu_new" | "gelu_pytorch_tanh" => Ok(Activation::NewGelu),
        "relu" => Ok(Activation::Relu),
        "sigmoid" => Ok(Activation::Sigmoid),
        other => Err(ConfigError::InvalidField {
            field: "act_fn".to_string(),
            reason: format!("unknown activation {other:?}"),
        }),
    }
}

/// Top-level run file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Longest sequence a batch row may hold; longer inputs are truncated.
    #[serde(default = "default_cutoff_len")]
    pub cutoff_len: usize,

    /// Upper bound on rows per batch.
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    #[serde(default)]
    pub pad_id: u32,

    #[serde(default)]
    pub collect_router_logits: bool,

    #[serde(default)]
    pub lora: Vec<AdapterConfig>,
}

fn default_cutoff_len() -> usize {
    256
}

fn default_max_rows() -> usize {
    16
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cutoff_len: default_cutoff_len(),
            max_rows: default_max_rows(),
            pad_id: 0,
            collect_router_logits: false,
            lora: Vec::new(),
        }
    }
}

impl RunConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn adapter(&self, name: &str) -> Option<&AdapterConfig> {
        self.lora.iter().find(|a| a.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rows == 0 {
            return Err(ConfigError::InvalidField {
                field: "max_rows".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.cutoff_len == 0 {
            return Err(ConfigError::InvalidField {
                field: "cutoff_len".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let mut seen = HashSet::new();
        for adapter in &self.lora {
            if !seen.insert(adapter.name.as_str()) {
                return Err(ConfigError::DuplicateAdapter(adapter.name.clone()));
            }
            adapter.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_adapter_defaults() {
        let json = r#"{ "name": "alpaca", "r": 8, "alpha": 16 }"#;
        let config: AdapterConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.rank, 8);
        assert!(!config.is_mixture());
        assert_eq!(config.top_k, 2);
        assert_eq!(config.routing_policy, RoutingPolicy::TopK);
        assert!((config.router_init_std - 0.02).abs() < f32::EPSILON);
        assert_eq!(config.padding_side, PaddingSide::Right);
        assert!((config.scaling() - 2.0).abs() < f32::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mixture_fields() {
        let json = r#"{
            "name": "mix",
            "rank": 4,
            "alpha": 8,
            "num_experts": 8,
            "top_k": 2,
            "routing_policy": "switch",
            "router_init_range": 0.1,
            "act_fn": "gelu",
            "padding_side": "left",
            "use_rslora": true
        }"#;
        let config: AdapterConfig = serde_json::from_str(json).unwrap();

        assert!(config.is_mixture());
        assert_eq!(config.routing_policy, RoutingPolicy::Switch);
        assert!((config.router_init_std - 0.1).abs() < f32::EPSILON);
        assert_eq!(config.activation().unwrap(), Some(Activation::Gelu));
        assert_eq!(config.padding_side, PaddingSide::Left);
        // rsLoRA scaling: alpha / sqrt(rank) = 8 / 2
        assert!((config.scaling() - 4.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{ "name": "a", "r": 2, "alpha": 4, "dropout": 0.05, "optim": "adamw" }"#;
        let config: AdapterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.name, "a");
    }

    #[test]
    fn test_missing_name_is_error() {
        let json = r#"{ "r": 2, "alpha": 4 }"#;
        let result: Result<AdapterConfig, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_adapter_validation() {
        assert!(AdapterConfig::linear("a", 0, 1.0).validate().is_err());

        let bad_top_k = AdapterConfig::mixture("m", 4, 8.0, 2, 3, RoutingPolicy::TopK);
        assert!(matches!(
            bad_top_k.validate(),
            Err(ConfigError::InvalidField { field, .. }) if field == "m.top_k"
        ));

        let mut bad_act = AdapterConfig::linear("a", 4, 8.0);
        bad_act.act_fn = Some("tanh-ish".to_string());
        assert!(bad_act.validate().is_err());
    }

    #[test]
    fn test_parse_activation() {
        assert_eq!(parse_activation("SiLU").unwrap(), Activation::Silu);
        assert_eq!(parse_activation("relu").unwrap(), Activation::Relu);
        assert!(parse_activation("softmax").is_err());
    }

    #[test]
    fn test_run_config_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");

        let config = RunConfig {
            max_rows: 8,
            collect_router_logits: true,
            lora: vec![
                AdapterConfig::linear("a", 4, 8.0),
                AdapterConfig::mixture("b", 4, 8.0, 4, 2, RoutingPolicy::TopK),
            ],
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = RunConfig::from_file(&path).unwrap();
        assert_eq!(loaded.max_rows, 8);
        assert!(loaded.collect_router_logits);
        assert_eq!(loaded.lora.len(), 2);
        assert_eq!(loaded.adapter("b").unwrap().num_experts, 4);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_run_config_defaults_and_duplicates() {
        let config = RunConfig::from_json_str(
            r#"{ "lora": [ { "name": "a", "r": 2, "alpha": 4 }, { "name": "a", "r": 2, "alpha": 4 } ], "save_step": 100 }"#,
        )
        .unwrap();
        assert_eq!(config.cutoff_len, 256);
        assert_eq!(config.max_rows, 16);
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateAdapter(name)) if name == "a"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let err = RunConfig::from_file(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
