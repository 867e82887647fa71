//! Encoding between consensus strings and reference-compressed form.
//!
//! The codec owns the fixed reference and the mask. Encoding walks the
//! input once, classifying every unmasked position; decoding rebuilds a
//! full-length string with masked positions rendered as `N` and ambiguous
//! positions rendered with their IUPAC code.
//!
//! The second encoding stage (double-delta) re-expresses a sequence's
//! position sets as symmetric differences against a previously stored
//! "local reference". For clustered populations most positions cancel,
//! so persisted records shrink considerably. A local reference is always
//! itself stored single-delta, bounding expansion to one extra lookup.

use std::collections::BTreeSet;

use crate::core::errors::CoreError;
use crate::core::types::Guid;
use crate::seq::compressed::{CompressedSequence, SequenceForm, SequenceRecord};
use crate::seq::iupac::{ambiguity_bases, Base, BaseFreqs};
use crate::seq::mask::MaskSet;

/// Minimum number of positions a double-delta encoding must save before it
/// is preferred over the single-delta form.
pub const MIN_DELTA_SAVING: usize = 8;

pub struct ReferenceCodec {
    reference: Vec<u8>,
    mask: MaskSet,
}

impl ReferenceCodec {
    /// Build a codec over `reference` with `mask` applied.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` if the reference is empty, contains a
    /// character other than `ACGT`, or disagrees with the mask's genome
    /// length.
    pub fn new(reference: &str, mask: MaskSet) -> Result<Self, CoreError> {
        if reference.is_empty() {
            return Err(CoreError::Config("reference cannot be empty".to_string()));
        }
        let reference: Vec<u8> = reference.bytes().map(|b| b.to_ascii_uppercase()).collect();
        if let Some(bad) = reference.iter().find(|b| !matches!(b, b'A' | b'C' | b'G' | b'T')) {
            return Err(CoreError::Config(format!(
                "reference contains character '{}' outside ACGT",
                *bad as char
            )));
        }
        if reference.len() != mask.genome_length() as usize {
            return Err(CoreError::Config(format!(
                "mask covers {} positions but reference has {}",
                mask.genome_length(),
                reference.len()
            )));
        }
        Ok(Self { reference, mask })
    }

    /// Genome length `L`.
    #[must_use]
    pub fn genome_length(&self) -> u32 {
        self.reference.len() as u32
    }

    #[must_use]
    pub fn mask(&self) -> &MaskSet {
        &self.mask
    }

    #[must_use]
    pub fn reference_base(&self, position: u32) -> char {
        self.reference[position as usize] as char
    }

    /// Encode a consensus string against the reference.
    ///
    /// `-` is treated as `N` and lowercase input is accepted. The sequence
    /// is flagged invalid when its uncertain proportion over unmasked
    /// positions exceeds `max_uncertain_proportion`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` on a length mismatch or a
    /// character outside the IUPAC alphabet.
    pub fn encode(
        &self,
        sequence: &str,
        max_uncertain_proportion: f64,
    ) -> Result<CompressedSequence, CoreError> {
        if sequence.len() != self.reference.len() {
            return Err(CoreError::InvalidInput(format!(
                "sequence length {} does not match reference length {}",
                sequence.len(),
                self.reference.len()
            )));
        }

        let mut compressed = CompressedSequence {
            a: BTreeSet::new(),
            c: BTreeSet::new(),
            g: BTreeSet::new(),
            t: BTreeSet::new(),
            n: BTreeSet::new(),
            m: std::collections::BTreeMap::new(),
            invalid: false,
            quality: 0.0,
        };

        for (i, raw) in sequence.bytes().enumerate() {
            let position = i as u32;
            if self.mask.contains(position) {
                continue;
            }
            let upper = raw.to_ascii_uppercase();
            match upper {
                b'N' | b'-' => {
                    compressed.n.insert(position);
                }
                b'A' | b'C' | b'G' | b'T' => {
                    if upper != self.reference[i] {
                        match upper {
                            b'A' => compressed.a.insert(position),
                            b'C' => compressed.c.insert(position),
                            b'G' => compressed.g.insert(position),
                            _ => compressed.t.insert(position),
                        };
                    }
                }
                other => match ambiguity_bases(other as char) {
                    Some(bases) => {
                        compressed.m.insert(position, BaseFreqs::uniform(bases));
                    }
                    None => {
                        return Err(CoreError::InvalidInput(format!(
                            "non-IUPAC character '{}' at position {position}",
                            other as char
                        )));
                    }
                },
            }
        }

        let n_uncertain = compressed.n.len() + compressed.m.len();
        let denominator = f64::from(self.mask.n_unmasked());
        let uncertain_proportion =
            if denominator > 0.0 { n_uncertain as f64 / denominator } else { 1.0 };
        compressed.quality = 1.0 - uncertain_proportion;
        compressed.invalid = uncertain_proportion > max_uncertain_proportion;

        Ok(compressed)
    }

    /// Rebuild the masked consensus string: reference bases where nothing
    /// is recorded, `N` at masked positions, IUPAC codes at ambiguities.
    #[must_use]
    pub fn decode(&self, compressed: &CompressedSequence) -> String {
        let mut seq = self.reference.clone();
        self.mask.apply(&mut seq);
        for base in [Base::A, Base::C, Base::G, Base::T] {
            for &position in compressed.base_set(base) {
                seq[position as usize] = base.to_char() as u8;
            }
        }
        for &position in &compressed.n {
            seq[position as usize] = b'N';
        }
        for (&position, freqs) in &compressed.m {
            seq[position as usize] = freqs.iupac_code() as u8;
        }
        String::from_utf8(seq).expect("sequence bytes are ASCII")
    }

    /// Persisted record in single-delta form.
    #[must_use]
    pub fn to_single_record(
        &self,
        compressed: &CompressedSequence,
        inserted_at: chrono::DateTime<chrono::Utc>,
    ) -> SequenceRecord {
        SequenceRecord {
            schema_version: crate::persist::SCHEMA_VERSION,
            form: SequenceForm::Single,
            a: compressed.a.clone(),
            c: compressed.c.clone(),
            g: compressed.g.clone(),
            t: compressed.t.clone(),
            n: compressed.n.clone(),
            m: compressed.m.clone(),
            invalid: compressed.invalid,
            quality: compressed.quality,
            inserted_at,
        }
    }

    /// Persisted record in double-delta form: each position set becomes its
    /// symmetric difference against `local_ref`'s set.
    #[must_use]
    pub fn to_delta_record(
        &self,
        compressed: &CompressedSequence,
        local_ref_guid: &Guid,
        local_ref: &CompressedSequence,
        inserted_at: chrono::DateTime<chrono::Utc>,
    ) -> SequenceRecord {
        let xor =
            |x: &BTreeSet<u32>, l: &BTreeSet<u32>| x.symmetric_difference(l).copied().collect();
        SequenceRecord {
            schema_version: crate::persist::SCHEMA_VERSION,
            form: SequenceForm::Delta { local_ref: local_ref_guid.clone() },
            a: xor(&compressed.a, &local_ref.a),
            c: xor(&compressed.c, &local_ref.c),
            g: xor(&compressed.g, &local_ref.g),
            t: xor(&compressed.t, &local_ref.t),
            n: xor(&compressed.n, &local_ref.n),
            m: compressed.m.clone(),
            invalid: compressed.invalid,
            quality: compressed.quality,
            inserted_at,
        }
    }

    /// Expand a persisted record back to single-delta form.
    ///
    /// For a double-delta record the caller resolves and passes the local
    /// reference; the symmetric difference is its own inverse, so applying
    /// it a second time recovers the original sets exactly.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Internal` if the record is double-delta and the
    /// local reference is missing or does not match the pointer.
    pub fn expand_record(
        &self,
        record: &SequenceRecord,
        local_ref: Option<(&Guid, &CompressedSequence)>,
    ) -> Result<CompressedSequence, CoreError> {
        match &record.form {
            SequenceForm::Single => Ok(CompressedSequence {
                a: record.a.clone(),
                c: record.c.clone(),
                g: record.g.clone(),
                t: record.t.clone(),
                n: record.n.clone(),
                m: record.m.clone(),
                invalid: record.invalid,
                quality: record.quality,
            }),
            SequenceForm::Delta { local_ref: wanted } => {
                let (guid, anchor) = local_ref.ok_or_else(|| {
                    CoreError::Internal(format!(
                        "double-delta record needs local reference {wanted}"
                    ))
                })?;
                if guid != wanted {
                    return Err(CoreError::Internal(format!(
                        "double-delta record points at {wanted} but {guid} was supplied"
                    )));
                }
                let xor = |d: &BTreeSet<u32>, l: &BTreeSet<u32>| {
                    d.symmetric_difference(l).copied().collect()
                };
                Ok(CompressedSequence {
                    a: xor(&record.a, &anchor.a),
                    c: xor(&record.c, &anchor.c),
                    g: xor(&record.g, &anchor.g),
                    t: xor(&record.t, &anchor.t),
                    n: xor(&record.n, &anchor.n),
                    m: record.m.clone(),
                    invalid: record.invalid,
                    quality: record.quality,
                })
            }
        }
    }

    /// Positions saved by encoding `compressed` against `local_ref` rather
    /// than single-delta. Negative when the anchor would make it bigger.
    #[must_use]
    pub fn delta_saving(compressed: &CompressedSequence, local_ref: &CompressedSequence) -> i64 {
        let xor_len = |x: &BTreeSet<u32>, l: &BTreeSet<u32>| x.symmetric_difference(l).count();
        let delta_size = xor_len(&compressed.a, &local_ref.a)
            + xor_len(&compressed.c, &local_ref.c)
            + xor_len(&compressed.g, &local_ref.g)
            + xor_len(&compressed.t, &local_ref.t)
            + xor_len(&compressed.n, &local_ref.n);
        let single_size = compressed.a.len()
            + compressed.c.len()
            + compressed.g.len()
            + compressed.t.len()
            + compressed.n.len();
        single_size as i64 - delta_size as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn codec(reference: &str) -> ReferenceCodec {
        let mask = MaskSet::empty(reference.len() as u32);
        ReferenceCodec::new(reference, mask).unwrap()
    }

    #[test]
    fn test_encode_reference_identical() {
        let codec = codec("AAAAAAAAAA");
        let seq = codec.encode("AAAAAAAAAA", 0.85).unwrap();
        assert_eq!(seq.n_stored_positions(), 0);
        assert!((seq.quality - 1.0).abs() < f64::EPSILON);
        assert!(!seq.invalid);
    }

    #[test]
    fn test_encode_classifies_positions() {
        let codec = codec("AAAAAAAAAA");
        let seq = codec.encode("ACGTN-RAAA", 0.85).unwrap();
        assert!(seq.c.contains(&1));
        assert!(seq.g.contains(&2));
        assert!(seq.t.contains(&3));
        assert!(seq.n.contains(&4));
        assert!(seq.n.contains(&5)); // '-' treated as N
        assert!(seq.m.contains_key(&6));
        assert!(seq.a.is_empty()); // matches reference, implicit
    }

    #[test]
    fn test_encode_rejects_bad_input() {
        let codec = codec("AAAA");
        assert!(matches!(codec.encode("AAA", 0.85), Err(CoreError::InvalidInput(_))));
        assert!(matches!(codec.encode("AAXA", 0.85), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_encode_skips_masked_positions() {
        let mask = MaskSet::from_positions([0, 1], 4).unwrap();
        let codec = ReferenceCodec::new("AAAA", mask).unwrap();
        // content under the mask is ignored, even an invalid-looking call
        let seq = codec.encode("CNGA", 0.85).unwrap();
        assert!(seq.c.is_empty());
        assert!(seq.n.is_empty());
        assert!(seq.g.contains(&2));
        // quality is over unmasked positions only
        assert!((seq.quality - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decode_round_trip() {
        let mask = MaskSet::from_positions([9], 10).unwrap();
        let codec = ReferenceCodec::new("AAAAAAAAAA", mask).unwrap();
        let seq = codec.encode("ACGTNRAAAA", 0.85).unwrap();
        // masked tail renders as N regardless of input
        assert_eq!(codec.decode(&seq), "ACGTNRAAAN");
    }

    #[test]
    fn test_quality_reflects_uncertain_proportion() {
        let codec = codec("AAAAAAAAAA");
        let seq = codec.encode("AANNNNAAAA", 0.3).unwrap();
        assert!((seq.quality - 0.6).abs() < 1e-9);
        assert!(seq.invalid); // 0.4 > 0.3
    }

    #[test]
    fn test_double_delta_round_trip() {
        let codec = codec("AAAAAAAAAA");
        let x = codec.encode("ACGTAAAANA", 0.85).unwrap();
        let anchor = codec.encode("ACGAAAAATA", 0.85).unwrap();
        let record =
            codec.to_delta_record(&x, &Guid::new("anchor"), &anchor, Utc::now());
        let expanded =
            codec.expand_record(&record, Some((&Guid::new("anchor"), &anchor))).unwrap();
        assert_eq!(expanded, x);
    }

    #[test]
    fn test_delta_saving() {
        let codec = codec("AAAAAAAAAA");
        let x = codec.encode("CCCCCAAAAA", 0.85).unwrap();
        let near = codec.encode("CCCCGAAAAA", 0.85).unwrap();
        let far = codec.encode("AAAAATTTTT", 0.85).unwrap();
        // near anchor: 5 single positions vs 2 delta positions
        assert_eq!(ReferenceCodec::delta_saving(&x, &near), 3);
        assert!(ReferenceCodec::delta_saving(&x, &far) < 0);
    }

    #[test]
    fn test_expand_rejects_wrong_anchor() {
        let codec = codec("AAAA");
        let x = codec.encode("CAAA", 0.85).unwrap();
        let anchor = codec.encode("CCAA", 0.85).unwrap();
        let record = codec.to_delta_record(&x, &Guid::new("right"), &anchor, Utc::now());
        let err = codec.expand_record(&record, Some((&Guid::new("wrong"), &anchor)));
        assert!(matches!(err, Err(CoreError::Internal(_))));
        let err = codec.expand_record(&record, None);
        assert!(matches!(err, Err(CoreError::Internal(_))));
    }
}
