//! Expected projection shapes from declared hyperparameters
//!
//! ```text
//! head_dim  = n_embd / n_head
//! q_out     = n_embd
//! k_out     = v_out = head_dim * n_head_kv
//! fused_out = q_out + k_out + v_out
//! ```
//!
//! Every projection reads from the embedding width, so the expected input
//! dim is `n_embd` for all roles.

use serde::{Deserialize, Serialize};

use crate::hparams::HyperparamSet;
use crate::observe::{ProjShape, TensorRole};

/// Expected attention projection widths for one [`HyperparamSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DerivedShapes {
    /// Hidden size the shapes were derived from (input width of every projection)
    pub n_embd: usize,
    /// Query head count the shapes were derived from
    pub n_head: usize,
    /// KV head count the shapes were derived from
    pub n_head_kv: usize,
    /// Per-head width
    pub head_dim: usize,
    /// Query projection output width
    pub q_out: usize,
    /// Key projection output width
    pub k_out: usize,
    /// Value projection output width
    pub v_out: usize,
    /// Fused QKV projection output width
    pub fused_out: usize,
}

impl DerivedShapes {
    /// Output width expected for `role`
    #[must_use]
    pub fn output_for(&self, role: TensorRole) -> usize {
        match role {
            TensorRole::FusedQkv => self.fused_out,
            TensorRole::QProj => self.q_out,
            TensorRole::KProj => self.k_out,
            TensorRole::VProj => self.v_out,
        }
    }

    /// Full `(n_embd, out)` shape expected for `role`
    #[must_use]
    pub fn expected_for(&self, role: TensorRole) -> ProjShape {
        ProjShape::new(self.n_embd, self.output_for(role))
    }

    /// Whether these shapes use shared KV heads
    #[must_use]
    pub fn is_gqa(&self) -> bool {
        self.n_head_kv < self.n_head
    }
}

/// Derive expected projection shapes. Pure and total over a valid set.
#[must_use]
pub fn derive(h: &HyperparamSet) -> DerivedShapes {
    let head_dim = h.head_dim();
    let kv_out = head_dim * h.n_head_kv();
    DerivedShapes {
        n_embd: h.n_embd(),
        n_head: h.n_head(),
        n_head_kv: h.n_head_kv(),
        head_dim,
        q_out: h.n_embd(),
        k_out: kv_out,
        v_out: kv_out,
        fused_out: h.n_embd() + 2 * kv_out,
    }
}

/// Shapes a loader would expect if it ignored GQA (`n_head_kv := n_head`).
#[must_use]
pub fn derive_mha(h: &HyperparamSet) -> DerivedShapes {
    derive(&h.as_multi_head())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_gqa_case() {
        let h = HyperparamSet::new(5120, 32, 8).expect("valid");
        let d = derive(&h);
        assert_eq!(d.head_dim, 160);
        assert_eq!(d.q_out, 5120);
        assert_eq!(d.k_out, 1280);
        assert_eq!(d.v_out, 1280);
        assert_eq!(d.fused_out, 7680);
        assert!(d.is_gqa());
    }

    #[test]
    fn test_mha_fused_is_three_times_embd() {
        let h = HyperparamSet::multi_head(4096, 32).expect("valid");
        let d = derive(&h);
        assert_eq!(d.fused_out, 3 * 4096);
        assert_eq!(d.k_out, 4096);
        assert!(!d.is_gqa());
    }

    #[test]
    fn test_multi_query_boundary() {
        let h = HyperparamSet::new(2048, 16, 1).expect("valid");
        let d = derive(&h);
        assert_eq!(d.head_dim, 128);
        assert_eq!(d.k_out, 128);
        assert_eq!(d.fused_out, 2048 + 256);
    }

    #[test]
    fn test_derive_mha_ignores_kv_heads() {
        let h = HyperparamSet::new(5120, 32, 8).expect("valid");
        let mha = derive_mha(&h);
        assert_eq!(mha.fused_out, 15360);
        assert_eq!(mha.n_head_kv, 32);
    }

    #[test]
    fn test_expected_for_roles() {
        let h = HyperparamSet::new(5120, 32, 8).expect("valid");
        let d = derive(&h);
        assert_eq!(d.expected_for(TensorRole::FusedQkv), ProjShape::new(5120, 7680));
        assert_eq!(d.expected_for(TensorRole::QProj), ProjShape::new(5120, 5120));
        assert_eq!(d.expected_for(TensorRole::KProj), ProjShape::new(5120, 1280));
        assert_eq!(d.expected_for(TensorRole::VProj), ProjShape::new(5120, 1280));
    }

    #[test]
    fn test_common_configurations() {
        // (name, n_embd, n_head, n_head_kv, expected kv_out)
        let cases = [
            ("LLaMA2-7B", 4096, 32, 32, 4096),
            ("LLaMA2-70B", 8192, 64, 8, 1024),
            ("Mistral-7B", 4096, 32, 8, 1024),
            ("BitNet-2B", 2560, 40, 10, 640),
            ("Qwen2-0.5B", 896, 14, 2, 128),
        ];
        for (name, e, h, kv, kv_out) in cases {
            let d = derive(&HyperparamSet::new(e, h, kv).expect(name));
            assert_eq!(d.k_out, kv_out, "{name}: k_out");
            assert_eq!(d.fused_out, e + 2 * kv_out, "{name}: fused_out");
        }
    }
}
