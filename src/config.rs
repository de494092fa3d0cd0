//! Hyperparameter sources and validation settings
//!
//! Reads the three attention hyperparameters from the collaborator formats
//! models actually ship with:
//!
//! - Hugging Face `config.json` next to a safetensors checkpoint
//! - GGUF metadata (`{arch}.embedding_length`, `{arch}.attention.head_count`,
//!   `{arch}.attention.head_count_kv`), already decoded by the GGUF parser
//!
//! Both funnel into [`HyperparamSet::new`], so every source gets the same
//! validation gate.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShapeCheckError};
use crate::hparams::HyperparamSet;
use crate::observe::TensorNaming;
use crate::reconcile::AmbiguityPolicy;

// ---------------------------------------------------------------------------
// Hugging Face config.json
// ---------------------------------------------------------------------------

/// Attention-relevant subset of a Hugging Face `config.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HfAttentionConfig {
    /// Hidden dimension
    #[serde(alias = "n_embd", alias = "d_model")]
    pub hidden_size: Option<usize>,
    /// Number of query heads
    #[serde(alias = "n_head", alias = "num_heads")]
    pub num_attention_heads: Option<usize>,
    /// Number of key-value heads (absent for MHA models)
    #[serde(
        alias = "n_head_kv",
        alias = "num_kv_heads",
        alias = "multi_query_group_num"
    )]
    pub num_key_value_heads: Option<usize>,
    /// Number of transformer blocks
    #[serde(alias = "n_layer", alias = "num_layers")]
    pub num_hidden_layers: Option<usize>,
    /// Model type (e.g., "llama", "phi")
    pub model_type: Option<String>,
    /// Architecture class names
    pub architectures: Option<Vec<String>>,
}

impl HfAttentionConfig {
    /// Parse from `config.json` contents; unrelated keys are ignored
    ///
    /// # Errors
    ///
    /// Returns `ShapeCheckError::ConfigParse` on malformed JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a `config.json` path
    ///
    /// # Errors
    ///
    /// Returns `ShapeCheckError::Io` if the file cannot be read, or
    /// `ShapeCheckError::ConfigParse` if it is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ShapeCheckError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&content)
    }

    /// Load `config.json` from the same directory as a model file
    ///
    /// # Errors
    ///
    /// Same as [`HfAttentionConfig::load`].
    pub fn load_from_sibling(model_path: &Path) -> Result<Self> {
        Self::load(&model_path.with_file_name("config.json"))
    }

    /// Number of key-value heads (defaults to `num_attention_heads` for MHA)
    #[must_use]
    pub fn num_kv_heads(&self) -> Option<usize> {
        self.num_key_value_heads.or(self.num_attention_heads)
    }

    /// Validate into a [`HyperparamSet`]
    ///
    /// # Errors
    ///
    /// Returns `MissingHyperparameter` for an absent hidden size or head
    /// count, `ConfigInvalid` if the values violate the GQA invariants.
    pub fn to_hyperparams(&self) -> Result<HyperparamSet> {
        let n_embd = self
            .hidden_size
            .ok_or_else(|| ShapeCheckError::MissingHyperparameter {
                key: "hidden_size".to_string(),
            })?;
        let n_head = self
            .num_attention_heads
            .ok_or_else(|| ShapeCheckError::MissingHyperparameter {
                key: "num_attention_heads".to_string(),
            })?;
        let n_head_kv = self.num_kv_heads().unwrap_or(n_head);
        HyperparamSet::new(n_embd, n_head, n_head_kv)
    }
}

// ---------------------------------------------------------------------------
// GGUF metadata
// ---------------------------------------------------------------------------

/// Decoded GGUF metadata value (subset needed here)
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    /// Any unsigned integer type
    UInt(u64),
    /// Any signed integer type
    Int(i64),
    /// Any float type
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Boolean
    Bool(bool),
    /// Array (per-layer head counts are stored this way)
    Array(Vec<MetadataValue>),
}

impl MetadataValue {
    /// Interpret as a non-negative count
    #[must_use]
    pub fn as_count(&self) -> Option<usize> {
        match self {
            Self::UInt(v) => usize::try_from(*v).ok(),
            Self::Int(v) => usize::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Interpret as a string
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Attention hyperparameters read from GGUF metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufAttentionMetadata {
    /// `general.architecture` (e.g., "llama", "phi2")
    pub architecture: String,
    /// `{arch}.embedding_length`
    pub embedding_length: usize,
    /// `{arch}.attention.head_count`
    pub head_count: usize,
    /// `{arch}.attention.head_count_kv`, or `head_count` when absent
    pub head_count_kv: usize,
    /// `{arch}.block_count`, if present
    pub block_count: Option<usize>,
}

impl GgufAttentionMetadata {
    /// Extract from decoded GGUF metadata
    ///
    /// # Errors
    ///
    /// Returns `MissingHyperparameter` if `general.architecture`,
    /// `{arch}.embedding_length` or `{arch}.attention.head_count` is absent,
    /// and `ConfigInvalid` if a head count is stored per layer with differing
    /// values.
    pub fn from_metadata(metadata: &HashMap<String, MetadataValue>) -> Result<Self> {
        let architecture = metadata
            .get("general.architecture")
            .and_then(MetadataValue::as_str)
            .ok_or_else(|| ShapeCheckError::MissingHyperparameter {
                key: "general.architecture".to_string(),
            })?
            .to_string();

        let count = |suffix: &str| -> Result<Option<usize>> {
            let key = format!("{architecture}.{suffix}");
            metadata.get(&key).map(|v| single_count(&key, v)).transpose()
        };
        let required = |suffix: &str| -> Result<usize> {
            count(suffix)?.ok_or_else(|| ShapeCheckError::MissingHyperparameter {
                key: format!("{architecture}.{suffix}"),
            })
        };

        let embedding_length = required("embedding_length")?;
        let head_count = required("attention.head_count")?;
        let head_count_kv = count("attention.head_count_kv")?.unwrap_or(head_count);
        let block_count = count("block_count")?;

        Ok(Self {
            architecture,
            embedding_length,
            head_count,
            head_count_kv,
            block_count,
        })
    }

    /// Validate into a [`HyperparamSet`]
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the values violate the GQA invariants.
    pub fn to_hyperparams(&self) -> Result<HyperparamSet> {
        HyperparamSet::new(self.embedding_length, self.head_count, self.head_count_kv)
    }
}

/// A scalar count, or a per-layer array whose entries all agree
fn single_count(key: &str, value: &MetadataValue) -> Result<usize> {
    let invalid = |reason: String| ShapeCheckError::ConfigInvalid { reason };
    match value {
        MetadataValue::Array(items) => {
            let counts: Vec<usize> = items.iter().filter_map(MetadataValue::as_count).collect();
            if counts.len() != items.len() {
                return Err(invalid(format!("{key}: array holds non-integer values")));
            }
            match counts.split_first() {
                None => Err(invalid(format!("{key}: empty per-layer array"))),
                Some((first, rest)) if rest.iter().all(|c| c == first) => Ok(*first),
                Some(_) => Err(invalid(format!(
                    "{key}: per-layer head counts vary ({counts:?}); only a single global \
                     attention configuration is supported"
                ))),
            }
        },
        other => other
            .as_count()
            .ok_or_else(|| invalid(format!("{key}: expected an integer, got {other:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Validation settings
// ---------------------------------------------------------------------------

/// Settings for [`crate::validate::ShapeValidator`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// What to do when both fused and split projections are present
    pub ambiguity_policy: AmbiguityPolicy,
    /// Stop validating layers after the first non-Match layer
    pub stop_at_first_failure: bool,
    /// Force a tensor naming convention instead of detecting it
    pub naming: Option<TensorNaming>,
}

impl ValidationConfig {
    /// Default settings: reject ambiguous layouts, check every layer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ambiguity policy
    #[must_use]
    pub fn with_ambiguity_policy(mut self, policy: AmbiguityPolicy) -> Self {
        self.ambiguity_policy = policy;
        self
    }

    /// Stop at the first failing layer
    #[must_use]
    pub fn with_stop_at_first_failure(mut self, stop: bool) -> Self {
        self.stop_at_first_failure = stop;
        self
    }

    /// Force a tensor naming convention
    #[must_use]
    pub fn with_naming(mut self, naming: TensorNaming) -> Self {
        self.naming = Some(naming);
        self
    }
}
