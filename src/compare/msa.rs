//! Multiple sequence alignment restricted to informative positions.
//!
//! An alignment over a set of stored sequences keeps only the columns
//! where at least one member records a non-reference base or an ambiguity.
//! For closely related isolates this reduces a whole genome to a handful
//! of columns, which is what the mixture tests and the tree-building
//! clients downstream actually consume.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use rand::Rng;
use serde::Serialize;

use crate::compare::mixture::estimate_expected_uncertain;
use crate::compare::stats::binomial_sf_geq;
use crate::core::errors::CoreError;
use crate::core::types::{Guid, UncertainChar};
use crate::seq::codec::ReferenceCodec;
use crate::seq::store::CompressedStore;

/// Default number of stored sequences sampled when estimating the
/// population uncertain-call rate.
pub const DEFAULT_SAMPLE_SIZE: usize = 30;

/// One aligned row with its uncertainty statistics.
///
/// The three p-values test, in order, whether this row's uncertain calls
/// within the alignment exceed what is expected from (1) the population
/// genome-wide rate, (2) the population rate at these columns, and (3)
/// this sequence's own rate outside the alignment. High values of any are
/// unremarkable; a low value flags excess uncertainty concentrated at the
/// variant sites, the signature of a mixed sample.
#[derive(Debug, Clone, Serialize)]
pub struct MsaRow {
    pub aligned: String,
    pub all_uncertain: usize,
    pub align_uncertain: usize,
    pub observed_proportion: Option<f64>,
    pub expected_proportion1: Option<f64>,
    pub p_value1: Option<f64>,
    pub expected_proportion2: Option<f64>,
    pub p_value2: Option<f64>,
    pub expected_proportion3: Option<f64>,
    pub p_value3: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MsaResult {
    /// Informative genome positions, ascending; the alignment's columns
    pub variant_positions: Vec<u32>,
    pub rows: BTreeMap<Guid, MsaRow>,
    /// Per-column counts of each aligned character
    pub column_base_counts: BTreeMap<u32, BTreeMap<char, usize>>,
    /// Requested guids excluded because they are flagged invalid
    pub invalid_guids: Vec<Guid>,
}

pub struct MsaBuilder {
    codec: Arc<ReferenceCodec>,
    /// Characters counted as uncertain in the row statistics
    uncertain_char: UncertainChar,
}

impl MsaBuilder {
    #[must_use]
    pub fn new(codec: Arc<ReferenceCodec>, uncertain_char: UncertainChar) -> Self {
        Self { codec, uncertain_char }
    }

    /// Align `guids` over their informative positions.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if any guid is unknown; rehydration
    /// failures propagate from the store.
    pub fn build<R: Rng>(
        &self,
        store: &CompressedStore,
        guids: &[Guid],
        rng: &mut R,
    ) -> Result<MsaResult, CoreError> {
        let mut requested: Vec<Guid> = Vec::new();
        let mut seen = HashSet::new();
        for guid in guids {
            if seen.insert(guid.clone()) {
                requested.push(guid.clone());
            }
        }

        let mut valid = Vec::new();
        let mut invalid_guids = Vec::new();
        for guid in requested {
            let summary = store
                .summary_of(&guid)
                .ok_or_else(|| CoreError::NotFound(format!("no sequence with guid {guid}")))?;
            if summary.invalid {
                invalid_guids.push(guid);
            } else {
                valid.push((guid.clone(), store.get(&guid)?));
            }
        }

        // columns: anywhere any member departs from the reference
        let mut columns: BTreeSet<u32> = BTreeSet::new();
        for (_, seq) in &valid {
            for base in crate::seq::iupac::BASES {
                columns.extend(seq.base_set(base).iter().copied());
            }
            columns.extend(seq.m.keys().copied());
        }
        let variant_positions: Vec<u32> = columns.iter().copied().collect();
        let n_columns = variant_positions.len();

        // population expectations for tests 1 and 2
        let exclude: HashSet<Guid> = invalid_guids.iter().cloned().collect();
        let genome_length = f64::from(self.codec.mask().n_unmasked());
        let expected_p1 = estimate_expected_uncertain(
            store,
            self.uncertain_char,
            DEFAULT_SAMPLE_SIZE,
            &exclude,
            None,
            rng,
        )?
        .map(|n| n / genome_length);
        let expected_p2 = if n_columns == 0 {
            None
        } else {
            estimate_expected_uncertain(
                store,
                self.uncertain_char,
                DEFAULT_SAMPLE_SIZE,
                &exclude,
                Some(&columns),
                rng,
            )?
            .map(|n| n / n_columns as f64)
        };

        let mut rows = BTreeMap::new();
        let mut column_base_counts: BTreeMap<u32, BTreeMap<char, usize>> = BTreeMap::new();
        for (guid, seq) in &valid {
            let mut aligned = String::with_capacity(n_columns);
            for &position in &variant_positions {
                let rendered =
                    seq.variant_at(position).unwrap_or_else(|| self.codec.reference_base(position));
                aligned.push(rendered);
                *column_base_counts.entry(position).or_default().entry(rendered).or_insert(0) += 1;
            }

            let all_uncertain = seq.n_uncertain(self.uncertain_char);
            let uncertain_positions = seq.uncertain_positions(self.uncertain_char);
            let align_uncertain =
                variant_positions.iter().filter(|p| uncertain_positions.contains(p)).count();

            let (observed_proportion, p_value1, p_value2, expected_proportion3, p_value3) =
                if n_columns == 0 {
                    (None, None, None, None, None)
                } else {
                    let observed = align_uncertain as f64 / n_columns as f64;
                    let p1 = expected_p1
                        .map(|p| binomial_sf_geq(align_uncertain as u64, n_columns as u64, p));
                    let p2 = expected_p2
                        .map(|p| binomial_sf_geq(align_uncertain as u64, n_columns as u64, p));
                    // test 3: expectation from this sequence's own rate
                    // outside the alignment
                    let outside = genome_length - n_columns as f64;
                    let expected3 = if outside > 0.0 {
                        Some((all_uncertain - align_uncertain) as f64 / outside)
                    } else {
                        None
                    };
                    let p3 = expected3
                        .map(|p| binomial_sf_geq(align_uncertain as u64, n_columns as u64, p));
                    (Some(observed), p1, p2, expected3, p3)
                };

            rows.insert(
                guid.clone(),
                MsaRow {
                    aligned,
                    all_uncertain,
                    align_uncertain,
                    observed_proportion,
                    expected_proportion1: expected_p1,
                    p_value1,
                    expected_proportion2: expected_p2,
                    p_value2,
                    expected_proportion3,
                    p_value3,
                },
            );
        }

        Ok(MsaResult { variant_positions, rows, column_base_counts, invalid_guids })
    }
}
