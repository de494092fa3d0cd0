//! Declared attention hyperparameters
//!
//! [`HyperparamSet`] is a newtype Poka-Yoke wrapper: once constructed, the
//! structural invariants below hold, so shape derivation never has an error
//! path.
//!
//! - `n_embd > 0`, `n_head > 0`, `n_head_kv > 0`
//! - `n_embd % n_head == 0` (head_dim must divide evenly)
//! - `n_head % n_head_kv == 0` (GQA ratio must be an integer)
//! - `3 * n_embd` fits in `usize` (bounds every derived width)

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShapeCheckError};

/// Validated attention hyperparameters (single global GQA configuration).
///
/// Fields are private; construction through [`HyperparamSet::new`] is the
/// validation gate for configuration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawHyperparams", into = "RawHyperparams")]
pub struct HyperparamSet {
    n_embd: usize,
    n_head: usize,
    n_head_kv: usize,
}

/// Unvalidated wire form used by serde
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawHyperparams {
    n_embd: usize,
    n_head: usize,
    n_head_kv: usize,
}

impl HyperparamSet {
    /// Validate and construct a hyperparameter set.
    ///
    /// # Errors
    ///
    /// Returns `ShapeCheckError::ConfigInvalid` if any structural invariant is
    /// violated.
    pub fn new(n_embd: usize, n_head: usize, n_head_kv: usize) -> Result<Self> {
        if n_embd == 0 {
            return Err(ShapeCheckError::ConfigInvalid {
                reason: "n_embd must be > 0".to_string(),
            });
        }
        if n_head == 0 {
            return Err(ShapeCheckError::ConfigInvalid {
                reason: "n_head must be > 0".to_string(),
            });
        }
        if n_head_kv == 0 {
            return Err(ShapeCheckError::ConfigInvalid {
                reason: "n_head_kv must be > 0".to_string(),
            });
        }
        if n_embd.checked_mul(3).is_none() {
            return Err(ShapeCheckError::ConfigInvalid {
                reason: format!("n_embd ({n_embd}) too large: fused QKV width overflows usize"),
            });
        }
        if !n_embd.is_multiple_of(n_head) {
            return Err(ShapeCheckError::ConfigInvalid {
                reason: format!(
                    "n_embd ({n_embd}) must be divisible by n_head ({n_head}) for head_dim consistency"
                ),
            });
        }
        if !n_head.is_multiple_of(n_head_kv) {
            return Err(ShapeCheckError::ConfigInvalid {
                reason: format!(
                    "n_head ({n_head}) must be divisible by n_head_kv ({n_head_kv}): GQA ratio must be an integer"
                ),
            });
        }

        Ok(Self {
            n_embd,
            n_head,
            n_head_kv,
        })
    }

    /// Standard multi-head attention (`n_head_kv == n_head`).
    ///
    /// # Errors
    ///
    /// Same conditions as [`HyperparamSet::new`].
    pub fn multi_head(n_embd: usize, n_head: usize) -> Result<Self> {
        Self::new(n_embd, n_head, n_head)
    }

    /// Model hidden size
    #[must_use]
    pub fn n_embd(&self) -> usize {
        self.n_embd
    }

    /// Number of query heads
    #[must_use]
    pub fn n_head(&self) -> usize {
        self.n_head
    }

    /// Number of key/value head groups
    #[must_use]
    pub fn n_head_kv(&self) -> usize {
        self.n_head_kv
    }

    // -- Derived getters --

    /// Dimension per attention head (`n_embd / n_head`).
    ///
    /// Exact because construction guarantees `n_embd % n_head == 0`.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Query heads per KV head (`n_head / n_head_kv`), 1 for plain MHA
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.n_head / self.n_head_kv
    }

    /// Whether key/value heads are shared between query heads
    #[must_use]
    pub fn is_gqa(&self) -> bool {
        self.n_head_kv < self.n_head
    }

    /// Same `n_embd`/`n_head`, with `n_head_kv` forced to `n_head`.
    #[must_use]
    pub fn as_multi_head(&self) -> Self {
        Self {
            n_head_kv: self.n_head,
            ..*self
        }
    }
}

impl TryFrom<RawHyperparams> for HyperparamSet {
    type Error = ShapeCheckError;

    fn try_from(raw: RawHyperparams) -> Result<Self> {
        Self::new(raw.n_embd, raw.n_head, raw.n_head_kv)
    }
}

impl From<HyperparamSet> for RawHyperparams {
    fn from(h: HyperparamSet) -> Self {
        Self {
            n_embd: h.n_embd,
            n_head: h.n_head,
            n_head_kv: h.n_head_kv,
        }
    }
}

impl std::fmt::Display for HyperparamSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n_embd={}, n_head={}, n_head_kv={} (head_dim={}, {}:1)",
            self.n_embd,
            self.n_head,
            self.n_head_kv,
            self.head_dim(),
            self.group_size()
        )
    }
}
