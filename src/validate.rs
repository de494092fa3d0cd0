//! Whole-model attention shape validation
//!
//! One global attention configuration per model: shapes are derived once and
//! every layer's projections are reconciled against them.
//!
//! ```text
//! HyperparamSet ─► derive ─► DerivedShapes ─┐
//!                                            ├─► reconcile (per layer) ─► Diagnosis ─► render
//! TensorMeta[] ─► observe_layers ─► Observed ┘
//! ```

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ValidationConfig;
use crate::derive::{derive, DerivedShapes};
use crate::error::Result;
use crate::hparams::HyperparamSet;
use crate::observe::{observe_layers, ObservedShapes, TensorMeta, TensorNaming};
use crate::reconcile::{reconcile, Diagnosis, ShapeReconciler};
use crate::report::{render, DiagnosisReport};

/// Validate a single layer's observations with default settings
#[must_use]
pub fn validate_layer(h: &HyperparamSet, observed: &ObservedShapes) -> Diagnosis {
    reconcile(&derive(h), observed)
}

/// Diagnosis for one layer; `layer` is `None` when the model had no
/// recognizable attention tensors at all
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerDiagnosis {
    /// Block index
    pub layer: Option<usize>,
    /// Reconciliation outcome
    pub diagnosis: Diagnosis,
}

/// Result of validating every layer of one model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelValidation {
    /// Hyperparameters the model was checked against
    pub hyperparams: HyperparamSet,
    /// Shapes derived from them
    pub derived: DerivedShapes,
    /// Naming convention used to classify tensors
    pub naming: TensorNaming,
    /// Per-layer outcomes in layer order
    pub layers: Vec<LayerDiagnosis>,
}

impl ModelValidation {
    /// Whether every checked layer matched
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.layers.iter().all(|l| l.diagnosis.is_match())
    }

    /// Non-Match layers
    pub fn failures(&self) -> impl Iterator<Item = &LayerDiagnosis> {
        self.layers.iter().filter(|l| !l.diagnosis.is_match())
    }

    /// First non-Match layer
    #[must_use]
    pub fn first_failure(&self) -> Option<&LayerDiagnosis> {
        self.failures().next()
    }

    /// Rendered reports, one per layer
    #[must_use]
    pub fn reports(&self) -> Vec<(Option<usize>, DiagnosisReport)> {
        self.layers
            .iter()
            .map(|l| (l.layer, render(&l.diagnosis)))
            .collect()
    }
}

/// One model to validate in a batch
#[derive(Debug, Clone)]
pub struct ModelInput {
    /// Label used in logs (typically the file path)
    pub label: String,
    /// Declared hyperparameters
    pub hyperparams: HyperparamSet,
    /// Tensor metadata from the file
    pub tensors: Vec<TensorMeta>,
    /// Declared block count (`num_hidden_layers` / `{arch}.block_count`)
    pub layer_count: Option<usize>,
}

/// Validates model files against their declared attention hyperparameters
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapeValidator {
    config: ValidationConfig,
}

impl ShapeValidator {
    /// Create a validator with the given settings
    #[must_use]
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Settings in effect
    #[must_use]
    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validate every layer of one model, taking the layer count from the
    /// highest layer index found in the file
    ///
    /// # Errors
    ///
    /// Returns `ShapeCheckError::InvalidTensorRank` if a recognized projection
    /// tensor is not 2-D.
    pub fn validate_model(
        &self,
        h: &HyperparamSet,
        tensors: &[TensorMeta],
    ) -> Result<ModelValidation> {
        self.validate_model_with_layers(h, tensors, None)
    }

    /// Validate every layer of one model.
    ///
    /// Layers `0..layer_count` are all checked; a layer with no recognized
    /// projection is reported as `MissingTensor`. Without a declared count,
    /// every layer up to the highest index in the file is checked. Layers
    /// beyond a declared count are still checked.
    ///
    /// # Errors
    ///
    /// Returns `ShapeCheckError::InvalidTensorRank` if a recognized projection
    /// tensor is not 2-D.
    pub fn validate_model_with_layers(
        &self,
        h: &HyperparamSet,
        tensors: &[TensorMeta],
        layer_count: Option<usize>,
    ) -> Result<ModelValidation> {
        let naming = self
            .config
            .naming
            .unwrap_or_else(|| TensorNaming::detect(tensors));
        let derived = derive(h);
        let reconciler = ShapeReconciler::new(self.config.ambiguity_policy);
        let observed = observe_layers(naming, tensors)?;
        let highest = observed.keys().next_back().map_or(0, |l| l + 1);
        let expected_layers = layer_count.unwrap_or(highest);

        debug!(
            hyperparams = %h,
            ?naming,
            fused_out = derived.fused_out,
            kv_out = derived.k_out,
            observed_layers = observed.len(),
            expected_layers,
            "validating attention projection shapes"
        );
        if highest > expected_layers {
            warn!(
                expected_layers,
                highest_layer = highest - 1,
                "tensors found beyond the declared layer count"
            );
        }

        let mut layers = Vec::with_capacity(expected_layers.max(observed.len()).max(1));
        let empty = ObservedShapes::new();
        if expected_layers == 0 && observed.is_empty() {
            let diagnosis = reconciler.reconcile(&derived, &empty);
            warn!(tag = %diagnosis.tag(), "no attention projection tensors recognized");
            layers.push(LayerDiagnosis {
                layer: None,
                diagnosis,
            });
        }

        let beyond = observed.range(expected_layers..).map(|(l, _)| *l);
        for layer in (0..expected_layers).chain(beyond) {
            let shapes = observed.get(&layer).unwrap_or(&empty);
            let diagnosis = reconciler.reconcile(&derived, shapes);
            let failed = !diagnosis.is_match();
            if failed {
                warn!(
                    layer,
                    tag = %diagnosis.tag(),
                    role = diagnosis.role_name().unwrap_or("-"),
                    "{}",
                    render(&diagnosis)
                );
            }
            layers.push(LayerDiagnosis {
                layer: Some(layer),
                diagnosis,
            });
            if failed && self.config.stop_at_first_failure {
                break;
            }
        }

        let validation = ModelValidation {
            hyperparams: *h,
            derived,
            naming,
            layers,
        };
        info!(
            ok = validation.is_ok(),
            checked = validation.layers.len(),
            failed = validation.failures().count(),
            "attention shape validation complete"
        );
        Ok(validation)
    }

    /// Validate several models in parallel; results keep input order
    pub fn validate_models(&self, inputs: &[ModelInput]) -> Vec<Result<ModelValidation>> {
        inputs
            .par_iter()
            .map(|input| {
                debug!(model = %input.label, "validating model");
                self.validate_model_with_layers(
                    &input.hyperparams,
                    &input.tensors,
                    input.layer_count,
                )
            })
            .collect()
    }
}
