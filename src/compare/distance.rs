//! Pairwise SNV distance on reference-compressed sequences.
//!
//! Because both sequences are stored as difference sets against the same
//! reference, the distance never touches the genome itself: a position can
//! only differ between two sequences if at least one of them records a
//! non-reference base there. Positions where either sequence is uncertain
//! (`N` or an ambiguity call) are skipped; neither side can contribute a
//! definite base at such a site.

use std::collections::BTreeSet;

use crate::core::types::UncertainChar;
use crate::seq::compressed::CompressedSequence;
use crate::seq::iupac::BASES;

/// Uncertainty class applied by the distance skip rule. Both no-calls and
/// ambiguity calls are skipped: counting either as a definite mismatch
/// would inflate distances for low-quality sequences.
const DISTANCE_SKIP_CLASS: UncertainChar = UncertainChar::NOrM;

/// N-position overlap statistics for a reported pair.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PairDetail {
    pub snv: Option<u32>,
    /// No-call count in the first sequence
    pub n1: usize,
    /// No-call count in the second
    pub n2: usize,
    /// Size of the union of both no-call sets
    pub n_either: usize,
}

/// Pairwise SNV distance computation bounded by the server's ceiling.
#[derive(Debug, Clone, Copy)]
pub struct Comparer {
    snv_ceiling: u32,
}

impl Comparer {
    #[must_use]
    pub fn new(snv_ceiling: u32) -> Self {
        Self { snv_ceiling }
    }

    #[must_use]
    pub fn snv_ceiling(&self) -> u32 {
        self.snv_ceiling
    }

    /// SNV distance between two sequences, or `None` when either sequence
    /// is invalid or the distance exceeds the ceiling.
    #[must_use]
    pub fn distance(&self, x: &CompressedSequence, y: &CompressedSequence) -> Option<u32> {
        self.distance_within(x, y, self.snv_ceiling)
    }

    /// SNV distance bounded by an explicit cutoff.
    ///
    /// Differing positions accumulate base by base, and the scan aborts as
    /// soon as the running count can no longer come in under `cutoff`.
    #[must_use]
    pub fn distance_within(
        &self,
        x: &CompressedSequence,
        y: &CompressedSequence,
        cutoff: u32,
    ) -> Option<u32> {
        if x.invalid || y.invalid {
            return None;
        }

        let x_uncertain = x.uncertain_positions(DISTANCE_SKIP_CLASS);
        let y_uncertain = y.uncertain_positions(DISTANCE_SKIP_CLASS);

        let mut differing: BTreeSet<u32> = BTreeSet::new();
        for base in BASES {
            let xs = x.base_set(base);
            let ys = y.base_set(base);
            // a position differs via this base when exactly one sequence
            // calls it here and the other is certain of something else
            for &position in xs {
                if !ys.contains(&position) && !y_uncertain.contains(&position) {
                    differing.insert(position);
                }
            }
            for &position in ys {
                if !xs.contains(&position) && !x_uncertain.contains(&position) {
                    differing.insert(position);
                }
            }
            if differing.len() > cutoff as usize {
                return None;
            }
        }
        Some(differing.len() as u32)
    }

    /// Distance plus the no-call overlap statistics reported alongside
    /// stored neighbour pairs.
    #[must_use]
    pub fn pair_detail(&self, x: &CompressedSequence, y: &CompressedSequence) -> PairDetail {
        let snv = self.distance(x, y);
        let n_either = x.n.union(&y.n).count();
        PairDetail { snv, n1: x.n.len(), n2: y.n.len(), n_either }
    }
}
