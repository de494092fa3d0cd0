//! Expected vs. observed shape reconciliation
//!
//! Layout is decided by which roles the file actually contains:
//!
//! | fused_qkv | q/k/v present | outcome                                  |
//! |-----------|---------------|------------------------------------------|
//! | yes       | none          | fused check                              |
//! | no        | all three     | split check (q, k, v order)              |
//! | yes       | any           | `AmbiguousLayout` (or policy preference) |
//! | no        | some          | `MissingTensor` (first absent of q, k, v)|
//! | no        | none          | `MissingTensor` ("any qkv projection")   |
//!
//! Reconciliation never coerces a shape to make it fit.

use serde::{Deserialize, Serialize};

use crate::derive::DerivedShapes;
use crate::error::ShapeCheckError;
use crate::observe::{ProjShape, TensorRole, TensorShapeObserver};

/// Role reported when no projection tensor was found at all
pub const ANY_QKV_PROJECTION: &str = "any qkv projection";

/// QKV storage layout found in a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// One `fused_qkv` tensor
    Fused,
    /// Separate `q_proj`, `k_proj`, `v_proj` tensors
    Split,
}

/// What to do when a file declares both fused and split projections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    /// Report `AmbiguousLayout`
    #[default]
    Reject,
    /// Check the fused tensor, ignore split tensors
    PreferFused,
    /// Check the split tensors (all three required), ignore the fused tensor
    PreferSplit,
}

/// Diagnosis tag, stable for pattern matching and serialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosisTag {
    /// Shapes agree
    Match,
    /// Shapes disagree
    Mismatch,
    /// Required projection tensor(s) absent
    MissingTensor,
    /// Both fused and split projections present
    AmbiguousLayout,
    /// Hyperparameters malformed
    ConfigInvalid,
}

impl DiagnosisTag {
    /// Stable tag name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Match => "Match",
            Self::Mismatch => "Mismatch",
            Self::MissingTensor => "MissingTensor",
            Self::AmbiguousLayout => "AmbiguousLayout",
            Self::ConfigInvalid => "ConfigInvalid",
        }
    }
}

impl std::fmt::Display for DiagnosisTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one validation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Diagnosis {
    /// All checked shapes agree
    Match {
        /// Layout that was checked
        layout: Layout,
    },
    /// First offending role and both shapes
    Mismatch {
        /// Offending tensor role
        role: TensorRole,
        /// Shape derived from the hyperparameters
        expected: ProjShape,
        /// Shape found in the file
        observed: ProjShape,
        /// Full derivation the comparison used
        derived: DerivedShapes,
    },
    /// A required tensor is absent; `None` means no projection at all
    MissingTensor {
        /// First absent role, if a partial split layout was found
        role: Option<TensorRole>,
    },
    /// Both fused and split roles are present
    AmbiguousLayout {
        /// Recognized roles that were present
        present: Vec<TensorRole>,
    },
    /// Hyperparameters failed validation
    ConfigInvalid {
        /// Violated invariant
        reason: String,
    },
}

impl Diagnosis {
    /// Tag of this diagnosis
    #[must_use]
    pub fn tag(&self) -> DiagnosisTag {
        match self {
            Self::Match { .. } => DiagnosisTag::Match,
            Self::Mismatch { .. } => DiagnosisTag::Mismatch,
            Self::MissingTensor { .. } => DiagnosisTag::MissingTensor,
            Self::AmbiguousLayout { .. } => DiagnosisTag::AmbiguousLayout,
            Self::ConfigInvalid { .. } => DiagnosisTag::ConfigInvalid,
        }
    }

    /// Whether shapes agree
    #[must_use]
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }

    /// Role name involved, if any
    #[must_use]
    pub fn role_name(&self) -> Option<&'static str> {
        match self {
            Self::Mismatch { role, .. } => Some(role.name()),
            Self::MissingTensor { role } => Some(role.map_or(ANY_QKV_PROJECTION, TensorRole::name)),
            Self::Match { .. } | Self::AmbiguousLayout { .. } | Self::ConfigInvalid { .. } => None,
        }
    }
}

/// Only hyperparameter errors are diagnoses; file and I/O errors are handed
/// back unchanged
impl TryFrom<ShapeCheckError> for Diagnosis {
    type Error = ShapeCheckError;

    fn try_from(err: ShapeCheckError) -> std::result::Result<Self, Self::Error> {
        match err {
            ShapeCheckError::ConfigInvalid { reason } => Ok(Self::ConfigInvalid { reason }),
            other => Err(other),
        }
    }
}

/// Result of inspecting which roles are present
#[derive(Debug, Clone, PartialEq, Eq)]
enum LayoutDetection {
    Layout(Layout),
    Ambiguous(Vec<TensorRole>),
    Missing(Option<TensorRole>),
}

/// Compares derived shapes against observed shapes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShapeReconciler {
    policy: AmbiguityPolicy,
}

impl ShapeReconciler {
    /// Create a reconciler with the given ambiguity policy
    #[must_use]
    pub fn new(policy: AmbiguityPolicy) -> Self {
        Self { policy }
    }

    /// Ambiguity policy in effect
    #[must_use]
    pub fn policy(&self) -> AmbiguityPolicy {
        self.policy
    }

    /// Reconcile one set of observations. Deterministic, no side effects.
    #[must_use]
    pub fn reconcile<O>(&self, expected: &DerivedShapes, observed: &O) -> Diagnosis
    where
        O: TensorShapeObserver + ?Sized,
    {
        match self.detect_layout(observed) {
            LayoutDetection::Layout(Layout::Fused) => check_fused(expected, observed),
            LayoutDetection::Layout(Layout::Split) => check_split(expected, observed),
            LayoutDetection::Ambiguous(present) => Diagnosis::AmbiguousLayout { present },
            LayoutDetection::Missing(role) => Diagnosis::MissingTensor { role },
        }
    }

    fn detect_layout<O>(&self, observed: &O) -> LayoutDetection
    where
        O: TensorShapeObserver + ?Sized,
    {
        let fused = observed.has(TensorRole::FusedQkv);
        let split: Vec<TensorRole> = TensorRole::SPLIT
            .into_iter()
            .filter(|r| observed.has(*r))
            .collect();
        let first_absent = TensorRole::SPLIT.into_iter().find(|r| !observed.has(*r));

        match (fused, split.is_empty()) {
            (true, true) => LayoutDetection::Layout(Layout::Fused),
            (true, false) => match self.policy {
                AmbiguityPolicy::Reject => {
                    let mut present = vec![TensorRole::FusedQkv];
                    present.extend(split);
                    LayoutDetection::Ambiguous(present)
                },
                AmbiguityPolicy::PreferFused => LayoutDetection::Layout(Layout::Fused),
                AmbiguityPolicy::PreferSplit => match first_absent {
                    None => LayoutDetection::Layout(Layout::Split),
                    Some(role) => LayoutDetection::Missing(Some(role)),
                },
            },
            (false, true) => LayoutDetection::Missing(None),
            (false, false) => match first_absent {
                None => LayoutDetection::Layout(Layout::Split),
                Some(role) => LayoutDetection::Missing(Some(role)),
            },
        }
    }
}

fn compare<O>(expected: &DerivedShapes, observed: &O, role: TensorRole) -> Option<Diagnosis>
where
    O: TensorShapeObserver + ?Sized,
{
    let want = expected.expected_for(role);
    let got = observed.shape_of(role)?;
    (got != want).then_some(Diagnosis::Mismatch {
        role,
        expected: want,
        observed: got,
        derived: *expected,
    })
}

fn check_fused<O>(expected: &DerivedShapes, observed: &O) -> Diagnosis
where
    O: TensorShapeObserver + ?Sized,
{
    compare(expected, observed, TensorRole::FusedQkv).unwrap_or(Diagnosis::Match {
        layout: Layout::Fused,
    })
}

fn check_split<O>(expected: &DerivedShapes, observed: &O) -> Diagnosis
where
    O: TensorShapeObserver + ?Sized,
{
    TensorRole::SPLIT
        .into_iter()
        .find_map(|role| compare(expected, observed, role))
        .unwrap_or(Diagnosis::Match {
            layout: Layout::Split,
        })
}

/// Reconcile with the default policy (`AmbiguityPolicy::Reject`)
#[must_use]
pub fn reconcile<O>(expected: &DerivedShapes, observed: &O) -> Diagnosis
where
    O: TensorShapeObserver + ?Sized,
{
    ShapeReconciler::default().reconcile(expected, observed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::derive;
    use crate::hparams::HyperparamSet;
    use crate::observe::ObservedShapes;

    fn reference() -> DerivedShapes {
        derive(&HyperparamSet::new(5120, 32, 8).expect("valid"))
    }

    fn split_from(d: &DerivedShapes) -> ObservedShapes {
        ObservedShapes::new()
            .with(TensorRole::QProj, d.expected_for(TensorRole::QProj))
            .with(TensorRole::KProj, d.expected_for(TensorRole::KProj))
            .with(TensorRole::VProj, d.expected_for(TensorRole::VProj))
    }

    #[test]
    fn test_fused_match() {
        let observed = ObservedShapes::new().with(TensorRole::FusedQkv, (5120, 7680));
        assert_eq!(
            reconcile(&reference(), &observed),
            Diagnosis::Match {
                layout: Layout::Fused
            }
        );
    }

    #[test]
    fn test_fused_mha_width_is_mismatch() {
        let observed = ObservedShapes::new().with(TensorRole::FusedQkv, (5120, 15360));
        let d = reconcile(&reference(), &observed);
        match d {
            Diagnosis::Mismatch {
                role,
                expected,
                observed,
                ..
            } => {
                assert_eq!(role, TensorRole::FusedQkv);
                assert_eq!(expected, ProjShape::new(5120, 7680));
                assert_eq!(observed, ProjShape::new(5120, 15360));
            },
            other => panic!("Expected Mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_fused_input_dim_checked() {
        let observed = ObservedShapes::new().with(TensorRole::FusedQkv, (4096, 7680));
        assert_eq!(reconcile(&reference(), &observed).tag(), DiagnosisTag::Mismatch);
    }

    #[test]
    fn test_split_match() {
        let d = reference();
        assert_eq!(
            reconcile(&d, &split_from(&d)),
            Diagnosis::Match {
                layout: Layout::Split
            }
        );
    }

    #[test]
    fn test_split_reports_first_offender() {
        let d = reference();
        // Both k and v carry MHA widths; k is reported first
        let observed = split_from(&d)
            .with(TensorRole::KProj, (5120, 5120))
            .with(TensorRole::VProj, (5120, 5120));
        let diag = reconcile(&d, &observed);
        assert_eq!(diag.role_name(), Some("k_proj"));
    }

    #[test]
    fn test_split_input_width_checked() {
        let d = reference();
        let observed = split_from(&d).with(TensorRole::KProj, (4096, 1280));
        assert_eq!(
            reconcile(&d, &observed),
            Diagnosis::Mismatch {
                role: TensorRole::KProj,
                expected: ProjShape::new(5120, 1280),
                observed: ProjShape::new(4096, 1280),
                derived: d,
            }
        );
    }

    #[test]
    fn test_split_q_checked_before_k() {
        let d = reference();
        let observed = split_from(&d)
            .with(TensorRole::QProj, (5120, 4096))
            .with(TensorRole::KProj, (5120, 5120));
        assert_eq!(reconcile(&d, &observed).role_name(), Some("q_proj"));
    }

    #[test]
    fn test_ambiguous_layout() {
        let observed = ObservedShapes::new()
            .with(TensorRole::FusedQkv, (5120, 7680))
            .with(TensorRole::KProj, (5120, 1280));
        assert_eq!(
            reconcile(&reference(), &observed),
            Diagnosis::AmbiguousLayout {
                present: vec![TensorRole::FusedQkv, TensorRole::KProj]
            }
        );
    }

    #[test]
    fn test_empty_is_missing_any() {
        let diag = reconcile(&reference(), &ObservedShapes::new());
        assert_eq!(diag, Diagnosis::MissingTensor { role: None });
        assert_eq!(diag.role_name(), Some(ANY_QKV_PROJECTION));
    }

    #[test]
    fn test_partial_split_is_missing_first_absent() {
        let observed = ObservedShapes::new()
            .with(TensorRole::QProj, (5120, 5120))
            .with(TensorRole::KProj, (5120, 1280));
        assert_eq!(
            reconcile(&reference(), &observed),
            Diagnosis::MissingTensor {
                role: Some(TensorRole::VProj)
            }
        );
    }

    #[test]
    fn test_unknown_roles_ignored() {
        let mut observed = ObservedShapes::new().with(TensorRole::FusedQkv, (5120, 7680));
        observed.insert_named("o_proj", (5120, 5120));
        assert!(reconcile(&reference(), &observed).is_match());

        let mut only_unknown = ObservedShapes::new();
        only_unknown.insert_named("o_proj", (5120, 5120));
        assert_eq!(
            reconcile(&reference(), &only_unknown).tag(),
            DiagnosisTag::MissingTensor
        );
    }

    #[test]
    fn test_prefer_fused_policy() {
        let d = reference();
        let observed = split_from(&d).with(TensorRole::FusedQkv, (5120, 7680));
        let r = ShapeReconciler::new(AmbiguityPolicy::PreferFused);
        assert_eq!(
            r.reconcile(&d, &observed),
            Diagnosis::Match {
                layout: Layout::Fused
            }
        );
    }

    #[test]
    fn test_prefer_split_policy() {
        let d = reference();
        let observed = split_from(&d).with(TensorRole::FusedQkv, (5120, 15360));
        let r = ShapeReconciler::new(AmbiguityPolicy::PreferSplit);
        assert_eq!(
            r.reconcile(&d, &observed),
            Diagnosis::Match {
                layout: Layout::Split
            }
        );

        let partial = ObservedShapes::new()
            .with(TensorRole::FusedQkv, (5120, 7680))
            .with(TensorRole::QProj, (5120, 5120));
        assert_eq!(
            r.reconcile(&d, &partial),
            Diagnosis::MissingTensor {
                role: Some(TensorRole::KProj)
            }
        );
    }

    #[test]
    fn test_all_four_roles_rejected_by_default() {
        let d = reference();
        let observed = split_from(&d).with(TensorRole::FusedQkv, (5120, 7680));
        assert_eq!(reconcile(&d, &observed).tag(), DiagnosisTag::AmbiguousLayout);
    }

    #[test]
    fn test_config_error_into_diagnosis() {
        let err = HyperparamSet::new(5120, 32, 7).expect_err("invalid");
        let diag = Diagnosis::try_from(err).expect("config error is a diagnosis");
        assert_eq!(diag.tag(), DiagnosisTag::ConfigInvalid);
        assert_eq!(diag.role_name(), None);
    }

    #[test]
    fn test_file_errors_are_not_diagnoses() {
        let rank = ShapeCheckError::InvalidTensorRank {
            name: "blk.0.attn_qkv.weight".to_string(),
            rank: 1,
        };
        assert_eq!(Diagnosis::try_from(rank.clone()), Err(rank));

        let missing = ShapeCheckError::MissingHyperparameter {
            key: "hidden_size".to_string(),
        };
        assert_eq!(Diagnosis::try_from(missing.clone()), Err(missing));

        let io = ShapeCheckError::Io {
            path: "config.json".to_string(),
            reason: "not found".to_string(),
        };
        assert!(matches!(
            Diagnosis::try_from(io),
            Err(ShapeCheckError::Io { .. })
        ));
    }

    #[test]
    fn test_tag_names_stable() {
        assert_eq!(DiagnosisTag::Match.to_string(), "Match");
        assert_eq!(DiagnosisTag::AmbiguousLayout.as_str(), "AmbiguousLayout");
        let json = serde_json::to_string(&DiagnosisTag::MissingTensor).expect("serialize");
        assert_eq!(json, "\"MissingTensor\"");
    }
}
