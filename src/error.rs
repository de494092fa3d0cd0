//! Error types for gqa-shapes
//!
//! Configuration problems and collaborator-input problems are errors.
//! Shape disagreements between a file and its declared hyperparameters are
//! NOT errors: they are reported as a [`crate::reconcile::Diagnosis`] so the
//! caller can decide whether to abort, warn, or proceed.

use thiserror::Error;

/// Error type for hyperparameter validation and collaborator input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeCheckError {
    /// Declared hyperparameters are malformed (non-positive counts,
    /// `n_embd % n_head != 0`, `n_head % n_head_kv != 0`)
    #[error("Invalid attention configuration: {reason}")]
    ConfigInvalid {
        /// Description of the violated invariant
        reason: String,
    },

    /// A required hyperparameter was not present in the config source
    #[error("Missing hyperparameter: {key}")]
    MissingHyperparameter {
        /// Key (or key path) that was looked up
        key: String,
    },

    /// Config source could not be parsed
    #[error("Failed to parse model config: {reason}")]
    ConfigParse {
        /// Description of the parse failure
        reason: String,
    },

    /// Config file could not be read
    #[error("I/O error reading {path}: {reason}")]
    Io {
        /// Path that was being read
        path: String,
        /// Underlying error message
        reason: String,
    },

    /// A recognized attention projection tensor is not a 2-D matrix
    #[error("Tensor '{name}' has rank {rank}, expected a 2-D projection matrix")]
    InvalidTensorRank {
        /// Tensor name as stored in the file
        name: String,
        /// Number of dimensions found
        rank: usize,
    },
}

/// Result type alias for gqa-shapes operations
pub type Result<T> = std::result::Result<T, ShapeCheckError>;

impl From<serde_json::Error> for ShapeCheckError {
    fn from(e: serde_json::Error) -> Self {
        Self::ConfigParse {
            reason: e.to_string(),
        }
    }
}
