//! Reference-compressed sequence representations.
//!
//! A consensus sequence is held as the sets of positions where it differs
//! from the reference, one set per base, plus the positions of no-calls and
//! ambiguous calls. Positions equal to the reference are implicit, so a
//! typical bacterial consensus compresses to a few hundred entries.
//!
//! Two forms exist: the expanded single-delta form used for all comparison
//! work, and a persisted record that may additionally be re-encoded as the
//! symmetric difference against a previously stored "local reference"
//! (double-delta), which shrinks records for densely clustered populations.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{Guid, UncertainChar};
use crate::seq::iupac::{Base, BaseFreqs};

/// Expanded (single-delta) form of one consensus sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedSequence {
    /// Positions called `A` where the reference is not `A`
    pub a: BTreeSet<u32>,
    pub c: BTreeSet<u32>,
    pub g: BTreeSet<u32>,
    pub t: BTreeSet<u32>,
    /// Positions with no call
    pub n: BTreeSet<u32>,
    /// Ambiguous positions and their base-call frequencies
    pub m: BTreeMap<u32, BaseFreqs>,
    /// Too many uncertain calls to participate in distances or clusters
    pub invalid: bool,
    /// Fraction of unmasked positions carrying a definite base
    pub quality: f64,
}

impl CompressedSequence {
    #[must_use]
    pub fn base_set(&self, base: Base) -> &BTreeSet<u32> {
        match base {
            Base::A => &self.a,
            Base::C => &self.c,
            Base::G => &self.g,
            Base::T => &self.t,
        }
    }

    /// Positions counted as uncertain under `class`.
    #[must_use]
    pub fn uncertain_positions(&self, class: UncertainChar) -> BTreeSet<u32> {
        match class {
            UncertainChar::N => self.n.clone(),
            UncertainChar::M => self.m.keys().copied().collect(),
            UncertainChar::NOrM => {
                let mut all = self.n.clone();
                all.extend(self.m.keys().copied());
                all
            }
        }
    }

    /// Count of uncertain positions under `class`.
    #[must_use]
    pub fn n_uncertain(&self, class: UncertainChar) -> usize {
        match class {
            UncertainChar::N => self.n.len(),
            UncertainChar::M => self.m.len(),
            UncertainChar::NOrM => self.n.len() + self.m.len(),
        }
    }

    /// The character called at `position`, or `None` where the sequence
    /// matches the reference. Ambiguous positions render as IUPAC codes.
    #[must_use]
    pub fn variant_at(&self, position: u32) -> Option<char> {
        for base in [Base::A, Base::C, Base::G, Base::T] {
            if self.base_set(base).contains(&position) {
                return Some(base.to_char());
            }
        }
        if self.n.contains(&position) {
            return Some('N');
        }
        self.m.get(&position).map(BaseFreqs::iupac_code)
    }

    /// Total number of stored positions across all sets; the payload size
    /// the double-delta encoder tries to shrink.
    #[must_use]
    pub fn n_stored_positions(&self) -> usize {
        self.a.len() + self.c.len() + self.g.len() + self.t.len() + self.n.len() + self.m.len()
    }
}

/// How a persisted sequence record encodes its position sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SequenceForm {
    /// Sets are relative to the global reference
    Single,
    /// Sets are the symmetric difference against `local_ref`'s sets
    Delta { local_ref: Guid },
}

/// Self-describing persisted form of one sequence.
///
/// When `form` is [`SequenceForm::Delta`], the five position sets hold the
/// symmetric difference against the local reference; the ambiguity map,
/// flags and quality are always stored verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub schema_version: u32,
    pub form: SequenceForm,
    pub a: BTreeSet<u32>,
    pub c: BTreeSet<u32>,
    pub g: BTreeSet<u32>,
    pub t: BTreeSet<u32>,
    pub n: BTreeSet<u32>,
    pub m: BTreeMap<u32, BaseFreqs>,
    pub invalid: bool,
    pub quality: f64,
    pub inserted_at: DateTime<Utc>,
}
