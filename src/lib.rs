//! # gqa-shapes
//!
//! Validates that a transformer's attention projection tensors, as stored in a
//! model file, agree with the declared attention hyperparameters, including
//! Grouped-Query Attention (GQA) models where `n_head_kv < n_head`.
//!
//! A wrong QKV width silently corrupts inference (wrong slicing, garbage
//! attention) or crashes deep inside a kernel. This crate derives the expected
//! widths and reports the first disagreement with an actionable diagnosis.
//!
//! ## Example
//!
//! ```rust
//! use gqa_shapes::{derive, reconcile, render, DiagnosisTag, HyperparamSet, ObservedShapes, TensorRole};
//!
//! let h = HyperparamSet::new(5120, 32, 8).unwrap();
//! let expected = derive(&h);
//! assert_eq!(expected.fused_out, 7680);
//!
//! // A file exported as if n_head_kv == n_head
//! let observed = ObservedShapes::new().with(TensorRole::FusedQkv, (5120, 15360));
//! let report = render(&reconcile(&expected, &observed));
//! assert_eq!(report.tag, DiagnosisTag::Mismatch);
//! assert!(report.note.unwrap().contains("unaccounted-for GQA"));
//! ```
//!
//! ## Pipeline
//!
//! - [`hparams`]: validated `HyperparamSet` (configuration errors stop here)
//! - [`derive`](mod@derive): expected q/k/v/fused widths
//! - [`observe`]: observed shapes from tensor metadata (GGUF and HF names)
//! - [`reconcile`](mod@reconcile): layout detection and comparison
//! - [`report`]: rendered diagnosis with a GQA advisory
//! - [`validate`]: per-layer and multi-model validation
//!
//! Everything is pure and synchronous; all values are immutable and
//! `Send + Sync`.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod derive;
pub mod error;
pub mod hparams;
pub mod observe;
pub mod reconcile;
pub mod report;
pub mod validate;

// Re-exports for convenience
pub use config::{GgufAttentionMetadata, HfAttentionConfig, MetadataValue, ValidationConfig};
pub use derive::{derive, derive_mha, DerivedShapes};
pub use error::{Result, ShapeCheckError};
pub use hparams::HyperparamSet;
pub use observe::{
    observe_layers, DimOrder, ObservedShapes, ProjShape, TensorMeta, TensorNaming, TensorRole,
    TensorShapeObserver,
};
pub use reconcile::{
    reconcile, AmbiguityPolicy, Diagnosis, DiagnosisTag, Layout, ShapeReconciler,
    ANY_QKV_PROJECTION,
};
pub use report::{render, Advisory, DiagnosisReport};
pub use validate::{
    validate_layer, LayerDiagnosis, ModelInput, ModelValidation, ShapeValidator,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
