//! Genome positions excluded from all distance computation.
//!
//! Masked positions typically cover repetitive or poorly-mapping regions
//! where variant calls are unreliable. The mask is fixed at startup and
//! applied once, at encoding time; no position set in the store ever
//! contains a masked position.

use std::io::BufRead;
use std::path::Path;

use crate::core::errors::CoreError;

/// Bitmap of excluded positions over a genome of known length.
#[derive(Debug, Clone)]
pub struct MaskSet {
    bits: Vec<u64>,
    genome_length: u32,
    n_masked: u32,
}

impl MaskSet {
    /// An empty mask over a genome of `genome_length` positions.
    #[must_use]
    pub fn empty(genome_length: u32) -> Self {
        let words = (genome_length as usize).div_ceil(64);
        Self { bits: vec![0u64; words], genome_length, n_masked: 0 }
    }

    /// Build a mask from a list of excluded positions.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` if any position falls outside
    /// `[0, genome_length)`.
    pub fn from_positions<I>(positions: I, genome_length: u32) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut mask = Self::empty(genome_length);
        for position in positions {
            if position >= genome_length {
                return Err(CoreError::Config(format!(
                    "mask position {position} outside genome of length {genome_length}"
                )));
            }
            let word = (position / 64) as usize;
            let bit = position % 64;
            if mask.bits[word] >> bit & 1 == 0 {
                mask.bits[word] |= 1u64 << bit;
                mask.n_masked += 1;
            }
        }
        Ok(mask)
    }

    /// Load a mask from a text file of integer positions, one per line.
    /// Blank lines and `#` comments are ignored.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` on I/O failure, unparseable lines or
    /// out-of-range positions.
    pub fn from_file(path: &Path, genome_length: u32) -> Result<Self, CoreError> {
        let file = std::fs::File::open(path)
            .map_err(|e| CoreError::Config(format!("cannot open mask file: {e}")))?;
        let mut positions = Vec::new();
        for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| CoreError::Config(format!("cannot read mask file: {e}")))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let position: u32 = trimmed.parse().map_err(|_| {
                CoreError::Config(format!(
                    "mask file line {}: expected an integer position, got '{trimmed}'",
                    line_no + 1
                ))
            })?;
            positions.push(position);
        }
        Self::from_positions(positions, genome_length)
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, position: u32) -> bool {
        if position >= self.genome_length {
            return false;
        }
        self.bits[(position / 64) as usize] >> (position % 64) & 1 == 1
    }

    /// Number of masked positions.
    #[must_use]
    pub fn n_masked(&self) -> u32 {
        self.n_masked
    }

    #[must_use]
    pub fn genome_length(&self) -> u32 {
        self.genome_length
    }

    /// Number of unmasked positions; the denominator for quality scores.
    #[must_use]
    pub fn n_unmasked(&self) -> u32 {
        self.genome_length - self.n_masked
    }

    /// All masked positions in ascending order.
    #[must_use]
    pub fn positions(&self) -> Vec<u32> {
        (0..self.genome_length).filter(|&p| self.contains(p)).collect()
    }

    /// Overwrite masked positions in `seq` with `N`.
    ///
    /// Used when rendering stored sequences; encoding excludes masked
    /// positions directly and never looks at their content.
    pub fn apply(&self, seq: &mut [u8]) {
        for position in 0..self.genome_length.min(seq.len() as u32) {
            if self.contains(position) {
                seq[position as usize] = b'N';
            }
        }
    }

    /// A short identifier for this mask: the count of excluded positions
    /// and an md5 over their sorted listing. Lets clients verify that two
    /// servers exclude the same sites.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let listing = serde_json::to_string(&self.positions()).unwrap_or_default();
        let digest = md5::compute(listing.as_bytes());
        format!("Excl {} nt [{:x}]", self.n_masked, digest)
    }
}
