//! Observed attention projection shapes
//!
//! The file-parsing collaborator owns the binary format. This module only
//! consumes tensor metadata it has already materialized (name + dims) and
//! exposes, per projection role, either "absent" or a concrete
//! `(input_dim, output_dim)` pair.
//!
//! Two tensor naming conventions are recognized:
//!
//! | Role        | GGUF                      | Hugging Face / safetensors                     |
//! |-------------|---------------------------|------------------------------------------------|
//! | `fused_qkv` | `blk.N.attn_qkv.weight`   | `model.layers.N.self_attn.qkv_proj.weight`     |
//! |             |                           | `model.layers.N.mixer.Wqkv.weight` (phi)       |
//! |             |                           | `transformer.h.N.self_attention.query_key_value.weight` (falcon) |
//! | `q_proj`    | `blk.N.attn_q.weight`     | `model.layers.N.self_attn.q_proj.weight`       |
//! | `k_proj`    | `blk.N.attn_k.weight`     | `model.layers.N.self_attn.k_proj.weight`       |
//! | `v_proj`    | `blk.N.attn_v.weight`     | `model.layers.N.self_attn.v_proj.weight`       |
//!
//! GGUF stores dims in `ne` order (`[in_features, out_features]`), PyTorch
//! checkpoints store row-major `[out_features, in_features]`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, ShapeCheckError};

/// Shape of a 2-D projection weight, independent of storage order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjShape {
    /// Features read by the projection (the embedding width)
    pub input_dim: usize,
    /// Features produced by the projection
    pub output_dim: usize,
}

impl ProjShape {
    /// Create a projection shape
    #[must_use]
    pub const fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
        }
    }
}

impl fmt::Display for ProjShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.input_dim, self.output_dim)
    }
}

impl From<(usize, usize)> for ProjShape {
    fn from((input_dim, output_dim): (usize, usize)) -> Self {
        Self::new(input_dim, output_dim)
    }
}

/// Attention projection role of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorRole {
    /// Single tensor holding q ‖ k ‖ v output columns
    FusedQkv,
    /// Query projection
    QProj,
    /// Key projection
    KProj,
    /// Value projection
    VProj,
}

impl TensorRole {
    /// All recognized roles
    pub const ALL: [TensorRole; 4] = [
        TensorRole::FusedQkv,
        TensorRole::QProj,
        TensorRole::KProj,
        TensorRole::VProj,
    ];

    /// Split-layout roles in reconciliation order
    pub const SPLIT: [TensorRole; 3] = [TensorRole::QProj, TensorRole::KProj, TensorRole::VProj];

    /// Stable role name used as the `ObservedShapes` key and in reports
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::FusedQkv => "fused_qkv",
            Self::QProj => "q_proj",
            Self::KProj => "k_proj",
            Self::VProj => "v_proj",
        }
    }

    /// Parse a role name; unrecognized names return `None`
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.name() == name)
    }
}

impl fmt::Display for TensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Anything that can answer "which shape does role X have in this file?"
///
/// Implemented by [`ObservedShapes`]; file-parsing collaborators may
/// implement it directly over their own tensor tables.
pub trait TensorShapeObserver {
    /// Shape of the tensor playing `role`, or `None` when absent
    fn shape_of(&self, role: TensorRole) -> Option<ProjShape>;

    /// Whether a tensor playing `role` is present
    fn has(&self, role: TensorRole) -> bool {
        self.shape_of(role).is_some()
    }
}

/// Role name → shape actually present in the file.
///
/// Keys are role names, so collaborators may record roles this crate does not
/// know about; those entries are ignored by reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservedShapes {
    shapes: BTreeMap<String, ProjShape>,
}

impl ObservedShapes {
    /// Empty observation (no projection tensors found)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: record a recognized role
    #[must_use]
    pub fn with(mut self, role: TensorRole, shape: impl Into<ProjShape>) -> Self {
        self.insert(role, shape);
        self
    }

    /// Record a recognized role, replacing any previous entry
    pub fn insert(&mut self, role: TensorRole, shape: impl Into<ProjShape>) {
        self.shapes.insert(role.name().to_string(), shape.into());
    }

    /// Record an arbitrary role name as reported by a collaborator
    pub fn insert_named(&mut self, role: impl Into<String>, shape: impl Into<ProjShape>) {
        self.shapes.insert(role.into(), shape.into());
    }

    /// Recognized roles present, in `TensorRole` order
    #[must_use]
    pub fn present_roles(&self) -> Vec<TensorRole> {
        TensorRole::ALL
            .into_iter()
            .filter(|r| self.shapes.contains_key(r.name()))
            .collect()
    }

    /// Number of entries, recognized or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    /// Whether no entries were recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

impl TensorShapeObserver for ObservedShapes {
    fn shape_of(&self, role: TensorRole) -> Option<ProjShape> {
        self.shapes.get(role.name()).copied()
    }
}

// ---------------------------------------------------------------------------
// Tensor-name adapters
// ---------------------------------------------------------------------------

/// Tensor metadata as materialized by the file-parsing collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    /// Tensor name as stored in the file
    pub name: String,
    /// Dimensions in file storage order
    pub dims: Vec<usize>,
}

impl TensorMeta {
    /// Create tensor metadata
    #[must_use]
    pub fn new(name: impl Into<String>, dims: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            dims,
        }
    }
}

/// Storage order of a 2-D weight's dims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimOrder {
    /// `[in_features, out_features]` (GGUF `ne` order)
    InputFirst,
    /// `[out_features, in_features]` (PyTorch row-major)
    OutputFirst,
}

/// Tensor naming convention of a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorNaming {
    /// llama.cpp GGUF names (`blk.N.attn_*`)
    Gguf,
    /// Hugging Face transformers names (`model.layers.N.self_attn.*`)
    HuggingFace,
}

const GGUF_LAYER_PREFIXES: &[&str] = &["blk."];
const HF_LAYER_PREFIXES: &[&str] = &["model.layers.", "transformer.h.", "layers."];

impl TensorNaming {
    /// Guess the convention from tensor names: any `blk.` tensor means GGUF.
    #[must_use]
    pub fn detect(tensors: &[TensorMeta]) -> Self {
        if tensors.iter().any(|t| t.name.starts_with("blk.")) {
            Self::Gguf
        } else {
            Self::HuggingFace
        }
    }

    /// Dim storage order used by this convention
    #[must_use]
    pub fn dim_order(self) -> DimOrder {
        match self {
            Self::Gguf => DimOrder::InputFirst,
            Self::HuggingFace => DimOrder::OutputFirst,
        }
    }

    /// Map a tensor name to `(layer, role)`; non-attention tensors map to `None`
    #[must_use]
    pub fn classify(self, name: &str) -> Option<(usize, TensorRole)> {
        let prefixes = match self {
            Self::Gguf => GGUF_LAYER_PREFIXES,
            Self::HuggingFace => HF_LAYER_PREFIXES,
        };
        let (layer, suffix) = split_layer(name, prefixes)?;
        let role = match (self, suffix) {
            (Self::Gguf, "attn_qkv.weight") => TensorRole::FusedQkv,
            (Self::Gguf, "attn_q.weight") => TensorRole::QProj,
            (Self::Gguf, "attn_k.weight") => TensorRole::KProj,
            (Self::Gguf, "attn_v.weight") => TensorRole::VProj,
            (
                Self::HuggingFace,
                "self_attn.qkv_proj.weight"
                | "mixer.Wqkv.weight"
                | "self_attention.query_key_value.weight",
            ) => TensorRole::FusedQkv,
            (Self::HuggingFace, "self_attn.q_proj.weight") => TensorRole::QProj,
            (Self::HuggingFace, "self_attn.k_proj.weight") => TensorRole::KProj,
            (Self::HuggingFace, "self_attn.v_proj.weight") => TensorRole::VProj,
            _ => return None,
        };
        Some((layer, role))
    }
}

fn split_layer<'a>(name: &'a str, prefixes: &[&str]) -> Option<(usize, &'a str)> {
    prefixes.iter().find_map(|prefix| {
        let rest = name.strip_prefix(prefix)?;
        let (idx, suffix) = rest.split_once('.')?;
        Some((idx.parse().ok()?, suffix))
    })
}

/// Convert stored dims into a [`ProjShape`]
///
/// # Errors
///
/// Returns `ShapeCheckError::InvalidTensorRank` unless `dims` has exactly two
/// entries.
pub fn proj_shape(name: &str, dims: &[usize], order: DimOrder) -> Result<ProjShape> {
    match (dims, order) {
        ([input, output], DimOrder::InputFirst) | ([output, input], DimOrder::OutputFirst) => {
            Ok(ProjShape::new(*input, *output))
        },
        _ => Err(ShapeCheckError::InvalidTensorRank {
            name: name.to_string(),
            rank: dims.len(),
        }),
    }
}

/// Group recognized attention projection tensors by layer.
///
/// Tensors that are not attention projections (norms, FFN, biases, ...) are
/// skipped. Layers with no recognized tensor do not appear in the map. When a
/// layer lists the same role twice, the first tensor is kept.
///
/// # Errors
///
/// Returns `ShapeCheckError::InvalidTensorRank` if a recognized projection
/// tensor is not 2-D.
pub fn observe_layers(
    naming: TensorNaming,
    tensors: &[TensorMeta],
) -> Result<BTreeMap<usize, ObservedShapes>> {
    let order = naming.dim_order();
    let mut layers: BTreeMap<usize, ObservedShapes> = BTreeMap::new();
    for tensor in tensors {
        let Some((layer, role)) = naming.classify(&tensor.name) else {
            continue;
        };
        let shape = proj_shape(&tensor.name, &tensor.dims, order)?;
        let shapes = layers.entry(layer).or_default();
        if let Some(first) = shapes.shape_of(role) {
            warn!(
                tensor = %tensor.name,
                layer,
                role = role.name(),
                kept = %first,
                ignored = %shape,
                "duplicate attention projection tensor"
            );
            continue;
        }
        shapes.insert(role, shape);
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names_roundtrip() {
        for role in TensorRole::ALL {
            assert_eq!(TensorRole::from_name(role.name()), Some(role));
        }
        assert_eq!(TensorRole::from_name("o_proj"), None);
    }

    #[test]
    fn test_proj_shape_display() {
        assert_eq!(ProjShape::new(5120, 7680).to_string(), "(5120, 7680)");
    }

    #[test]
    fn test_observed_shapes_absent_is_none() {
        let observed = ObservedShapes::new().with(TensorRole::FusedQkv, (5120, 7680));
        assert_eq!(
            observed.shape_of(TensorRole::FusedQkv),
            Some(ProjShape::new(5120, 7680))
        );
        assert!(!observed.has(TensorRole::QProj));
        assert_eq!(observed.present_roles(), vec![TensorRole::FusedQkv]);
    }

    #[test]
    fn test_unknown_role_names_kept_but_not_recognized() {
        let mut observed = ObservedShapes::new();
        observed.insert_named("o_proj", (4096, 4096));
        assert_eq!(observed.len(), 1);
        assert!(observed.present_roles().is_empty());
    }

    #[test]
    fn test_classify_gguf_names() {
        let n = TensorNaming::Gguf;
        assert_eq!(
            n.classify("blk.0.attn_qkv.weight"),
            Some((0, TensorRole::FusedQkv))
        );
        assert_eq!(
            n.classify("blk.39.attn_k.weight"),
            Some((39, TensorRole::KProj))
        );
        assert_eq!(n.classify("blk.0.attn_qkv.bias"), None);
        assert_eq!(n.classify("blk.0.attn_output.weight"), None);
        assert_eq!(n.classify("token_embd.weight"), None);
        assert_eq!(n.classify("blk.x.attn_q.weight"), None);
    }

    #[test]
    fn test_classify_hf_names() {
        let n = TensorNaming::HuggingFace;
        assert_eq!(
            n.classify("model.layers.3.self_attn.v_proj.weight"),
            Some((3, TensorRole::VProj))
        );
        assert_eq!(
            n.classify("model.layers.0.self_attn.qkv_proj.weight"),
            Some((0, TensorRole::FusedQkv))
        );
        assert_eq!(
            n.classify("model.layers.1.mixer.Wqkv.weight"),
            Some((1, TensorRole::FusedQkv))
        );
        assert_eq!(
            n.classify("transformer.h.7.self_attention.query_key_value.weight"),
            Some((7, TensorRole::FusedQkv))
        );
        assert_eq!(n.classify("model.layers.0.mlp.up_proj.weight"), None);
        assert_eq!(n.classify("model.embed_tokens.weight"), None);
    }

    #[test]
    fn test_detect_naming() {
        let gguf = vec![TensorMeta::new("blk.0.attn_q.weight", vec![64, 64])];
        let hf = vec![TensorMeta::new(
            "model.layers.0.self_attn.q_proj.weight",
            vec![64, 64],
        )];
        assert_eq!(TensorNaming::detect(&gguf), TensorNaming::Gguf);
        assert_eq!(TensorNaming::detect(&hf), TensorNaming::HuggingFace);
        assert_eq!(TensorNaming::detect(&[]), TensorNaming::HuggingFace);
    }

    #[test]
    fn test_proj_shape_respects_dim_order() {
        let gguf = proj_shape("t", &[5120, 7680], DimOrder::InputFirst).expect("2-D");
        let hf = proj_shape("t", &[7680, 5120], DimOrder::OutputFirst).expect("2-D");
        assert_eq!(gguf, ProjShape::new(5120, 7680));
        assert_eq!(hf, gguf);
    }

    #[test]
    fn test_proj_shape_rejects_non_matrix() {
        let err = proj_shape("blk.0.attn_q.weight", &[4096], DimOrder::InputFirst)
            .expect_err("1-D must fail");
        assert_eq!(
            err,
            ShapeCheckError::InvalidTensorRank {
                name: "blk.0.attn_q.weight".to_string(),
                rank: 1,
            }
        );
    }

    #[test]
    fn test_observe_layers_groups_by_layer() {
        let tensors = vec![
            TensorMeta::new("token_embd.weight", vec![5120, 32000]),
            TensorMeta::new("blk.0.attn_qkv.weight", vec![5120, 7680]),
            TensorMeta::new("blk.0.attn_norm.weight", vec![5120]),
            TensorMeta::new("blk.1.attn_qkv.weight", vec![5120, 7680]),
        ];
        let layers = observe_layers(TensorNaming::Gguf, &tensors).expect("valid");
        assert_eq!(layers.len(), 2);
        assert_eq!(
            layers[&1].shape_of(TensorRole::FusedQkv),
            Some(ProjShape::new(5120, 7680))
        );
    }

    #[test]
    fn test_observe_layers_keeps_first_duplicate() {
        let tensors = vec![
            TensorMeta::new("blk.0.attn_q.weight", vec![5120, 5120]),
            TensorMeta::new("blk.0.attn_q.weight", vec![5120, 4096]),
        ];
        let layers = observe_layers(TensorNaming::Gguf, &tensors).expect("valid");
        assert_eq!(layers[&0].len(), 1);
        assert_eq!(
            layers[&0].shape_of(TensorRole::QProj),
            Some(ProjShape::new(5120, 5120))
        );
    }

    #[test]
    fn test_observe_layers_rank_error() {
        let tensors = vec![TensorMeta::new("blk.0.attn_k.weight", vec![5120, 1280, 1])];
        assert!(matches!(
            observe_layers(TensorNaming::Gguf, &tensors),
            Err(ShapeCheckError::InvalidTensorRank { rank: 3, .. })
        ));
    }
}
