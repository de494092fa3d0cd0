//! Human-actionable rendering of a [`Diagnosis`]
//!
//! A report is a plain record with stable field names (`tag`, `role`,
//! `expected`, `observed`, `advisory`, `note`, `summary`) so callers and
//! tests can pattern-match on it and serialize it with serde.
//!
//! For `Mismatch`, an advisory names the hyperparameter that most plausibly
//! explains the discrepancy. The advisory is a heuristic: it never changes
//! the diagnosis tag.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::derive::DerivedShapes;
use crate::observe::{ProjShape, TensorRole};
use crate::reconcile::{Diagnosis, DiagnosisTag, Layout};

/// Heuristic explanation of a shape mismatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    /// Config declares GQA but the file was written with the multi-head
    /// formula (`n_head_kv == n_head`)
    UnaccountedGqa {
        /// `n_head_kv` from the config
        declared_kv_heads: usize,
        /// KV head count implied by the observed width
        implied_kv_heads: usize,
    },
    /// Config declares plain multi-head attention but the file carries
    /// grouped KV widths
    UndeclaredGqa {
        /// KV head count implied by the observed width
        implied_kv_heads: usize,
    },
    /// Both sides use GQA, with different group counts
    KvHeadCountDisagrees {
        /// `n_head_kv` from the config
        declared_kv_heads: usize,
        /// KV head count implied by the observed width
        implied_kv_heads: usize,
    },
    /// Projection input width differs from the declared hidden size
    EmbeddingWidth {
        /// `n_embd` from the config
        declared_n_embd: usize,
        /// Input width found in the file
        observed_input: usize,
    },
    /// Query projection width differs from `n_head * head_dim`
    QueryWidth {
        /// `n_head` from the config
        declared_heads: usize,
        /// Query width found in the file
        observed_output: usize,
    },
}

impl Advisory {
    /// Name of the hyperparameter this advisory blames
    #[must_use]
    pub fn hyperparameter(&self) -> &'static str {
        match self {
            Self::UnaccountedGqa { .. }
            | Self::UndeclaredGqa { .. }
            | Self::KvHeadCountDisagrees { .. } => "n_head_kv",
            Self::EmbeddingWidth { .. } => "n_embd",
            Self::QueryWidth { .. } => "n_head",
        }
    }
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnaccountedGqa {
                declared_kv_heads,
                implied_kv_heads,
            } => write!(
                f,
                "this looks like an unaccounted-for GQA configuration: config declares \
                 n_head_kv={declared_kv_heads} but the tensor matches the multi-head formula \
                 (n_head_kv == n_head == {implied_kv_heads})"
            ),
            Self::UndeclaredGqa { implied_kv_heads } => write!(
                f,
                "tensor matches a GQA layout with n_head_kv={implied_kv_heads}, but config \
                 declares n_head_kv == n_head; check n_head_kv in the model config"
            ),
            Self::KvHeadCountDisagrees {
                declared_kv_heads,
                implied_kv_heads,
            } => write!(
                f,
                "tensor implies n_head_kv={implied_kv_heads}, config declares \
                 n_head_kv={declared_kv_heads}"
            ),
            Self::EmbeddingWidth {
                declared_n_embd,
                observed_input,
            } => write!(
                f,
                "projection reads {observed_input} features but config declares \
                 n_embd={declared_n_embd}"
            ),
            Self::QueryWidth {
                declared_heads,
                observed_output,
            } => write!(
                f,
                "query width {observed_output} != n_head * head_dim with \
                 n_head={declared_heads}; check n_head (or an explicit head_dim)"
            ),
        }
    }
}

/// KV head count `g` that would produce `output` for `role`, if any valid one does
fn implied_kv_heads(derived: &DerivedShapes, role: TensorRole, output: usize) -> Option<usize> {
    let kv_width = match role {
        TensorRole::KProj | TensorRole::VProj => output,
        TensorRole::FusedQkv => {
            let rest = output.checked_sub(derived.n_embd)?;
            if !rest.is_multiple_of(2) {
                return None;
            }
            rest / 2
        },
        TensorRole::QProj => return None,
    };
    if derived.head_dim == 0 || !kv_width.is_multiple_of(derived.head_dim) {
        return None;
    }
    let g = kv_width / derived.head_dim;
    ((1..=derived.n_head).contains(&g) && derived.n_head.is_multiple_of(g)).then_some(g)
}

/// Explain a mismatch in terms of the declared hyperparameters
#[must_use]
pub fn advise(
    role: TensorRole,
    expected: ProjShape,
    observed: ProjShape,
    derived: &DerivedShapes,
) -> Option<Advisory> {
    if observed.input_dim != expected.input_dim {
        return Some(Advisory::EmbeddingWidth {
            declared_n_embd: derived.n_embd,
            observed_input: observed.input_dim,
        });
    }
    if role == TensorRole::QProj {
        return Some(Advisory::QueryWidth {
            declared_heads: derived.n_head,
            observed_output: observed.output_dim,
        });
    }

    let implied = implied_kv_heads(derived, role, observed.output_dim)?;
    let declared = derived.n_head_kv;
    if implied == declared {
        return None;
    }
    Some(if implied == derived.n_head {
        Advisory::UnaccountedGqa {
            declared_kv_heads: declared,
            implied_kv_heads: implied,
        }
    } else if declared == derived.n_head {
        Advisory::UndeclaredGqa {
            implied_kv_heads: implied,
        }
    } else {
        Advisory::KvHeadCountDisagrees {
            declared_kv_heads: declared,
            implied_kv_heads: implied,
        }
    })
}

/// Structured, human-readable rendering of a diagnosis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisReport {
    /// Diagnosis tag
    pub tag: DiagnosisTag,
    /// Tensor role involved, if any
    pub role: Option<String>,
    /// What the hyperparameters require
    pub expected: Option<String>,
    /// What the file contains
    pub observed: Option<String>,
    /// Structured advisory (Mismatch only)
    pub advisory: Option<Advisory>,
    /// Advisory or error text
    pub note: Option<String>,
    /// One-line summary
    pub summary: String,
}

impl fmt::Display for DiagnosisReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.tag, self.summary)?;
        if let Some(note) = &self.note {
            write!(f, "\n  note: {note}")?;
        }
        Ok(())
    }
}

fn layout_name(layout: Layout) -> &'static str {
    match layout {
        Layout::Fused => "fused",
        Layout::Split => "split",
    }
}

/// Render a diagnosis into a report
#[must_use]
pub fn render(d: &Diagnosis) -> DiagnosisReport {
    let tag = d.tag();
    let role = d.role_name().map(str::to_string);
    match d {
        Diagnosis::Match { layout } => DiagnosisReport {
            tag,
            role,
            expected: None,
            observed: None,
            advisory: None,
            note: None,
            summary: format!("{} QKV projection shapes match", layout_name(*layout)),
        },
        Diagnosis::Mismatch {
            role: r,
            expected,
            observed,
            derived,
        } => {
            let advisory = advise(*r, *expected, *observed, derived);
            DiagnosisReport {
                tag,
                role,
                expected: Some(expected.to_string()),
                observed: Some(observed.to_string()),
                advisory,
                note: advisory.map(|a| format!("suspect {}: {a}", a.hyperparameter())),
                summary: format!("{r}: expected {expected}, observed {observed}"),
            }
        },
        Diagnosis::MissingTensor { role: missing } => {
            let what = missing.map_or_else(
                || "fused_qkv or q_proj/k_proj/v_proj".to_string(),
                |r| r.name().to_string(),
            );
            DiagnosisReport {
                tag,
                summary: match missing {
                    Some(r) => format!("no {r} tensor found"),
                    None => format!("no qkv projection tensor found ({what})"),
                },
                role,
                expected: Some(what),
                observed: Some("absent".to_string()),
                advisory: None,
                note: None,
            }
        },
        Diagnosis::AmbiguousLayout { present } => {
            let names: Vec<&str> = present.iter().map(|r| r.name()).collect();
            DiagnosisReport {
                tag,
                role,
                expected: Some("fused_qkv xor q_proj/k_proj/v_proj".to_string()),
                observed: Some(names.join(" + ")),
                advisory: None,
                note: Some(
                    "file declares both fused and split projections; \
                     corrupt file or unsupported export variant"
                        .to_string(),
                ),
                summary: format!("conflicting QKV layouts: {}", names.join(", ")),
            }
        },
        Diagnosis::ConfigInvalid { reason } => DiagnosisReport {
            tag,
            role,
            expected: None,
            observed: None,
            advisory: None,
            note: Some(reason.clone()),
            summary: "invalid attention hyperparameters".to_string(),
        },
    }
}
