//! IUPAC nucleotide alphabet support.
//!
//! Consensus input may carry the four unambiguous bases, `N` (no call),
//! `-` (treated as `N`), or any IUPAC ambiguity code. Ambiguity codes are
//! modelled as a base-frequency record with uniform weight over the code's
//! constituent bases.

use serde::{Deserialize, Serialize};

/// One unambiguous nucleotide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Base {
    A,
    C,
    G,
    T,
}

/// All four bases in the order used throughout the engine.
pub const BASES: [Base; 4] = [Base::A, Base::C, Base::G, Base::T];

impl Base {
    #[must_use]
    pub fn to_char(self) -> char {
        match self {
            Self::A => 'A',
            Self::C => 'C',
            Self::G => 'G',
            Self::T => 'T',
        }
    }

    #[must_use]
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'A' => Some(Self::A),
            'C' => Some(Self::C),
            'G' => Some(Self::G),
            'T' => Some(Self::T),
            _ => None,
        }
    }
}

/// Relative base-call frequencies at an ambiguous position.
///
/// The four weights sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaseFreqs {
    pub a: f64,
    pub c: f64,
    pub g: f64,
    pub t: f64,
}

impl BaseFreqs {
    /// Uniform frequencies over a non-empty set of bases.
    #[must_use]
    pub fn uniform(bases: &[Base]) -> Self {
        let weight = 1.0 / bases.len() as f64;
        let mut freqs = Self { a: 0.0, c: 0.0, g: 0.0, t: 0.0 };
        for base in bases {
            match base {
                Base::A => freqs.a = weight,
                Base::C => freqs.c = weight,
                Base::G => freqs.g = weight,
                Base::T => freqs.t = weight,
            }
        }
        freqs
    }

    /// Bases with non-zero weight, in A,C,G,T order.
    #[must_use]
    pub fn bases(&self) -> Vec<Base> {
        let mut bases = Vec::with_capacity(2);
        if self.a > 0.0 {
            bases.push(Base::A);
        }
        if self.c > 0.0 {
            bases.push(Base::C);
        }
        if self.g > 0.0 {
            bases.push(Base::G);
        }
        if self.t > 0.0 {
            bases.push(Base::T);
        }
        bases
    }

    /// The IUPAC code covering the bases with non-zero weight.
    #[must_use]
    pub fn iupac_code(&self) -> char {
        code_for_bases(&self.bases())
    }
}

/// Constituent bases of an IUPAC ambiguity code.
///
/// Returns `None` for anything that is not a two- or three-base ambiguity
/// code; `A`/`C`/`G`/`T`/`N` are handled by the caller.
#[must_use]
pub fn ambiguity_bases(c: char) -> Option<&'static [Base]> {
    use Base::{A, C, G, T};
    match c {
        'R' => Some(&[A, G]),
        'Y' => Some(&[C, T]),
        'S' => Some(&[C, G]),
        'W' => Some(&[A, T]),
        'K' => Some(&[G, T]),
        'M' => Some(&[A, C]),
        'B' => Some(&[C, G, T]),
        'D' => Some(&[A, G, T]),
        'H' => Some(&[A, C, T]),
        'V' => Some(&[A, C, G]),
        _ => None,
    }
}

/// The IUPAC code for a set of bases.
///
/// The empty set and the full set both render as `N`.
#[must_use]
pub fn code_for_bases(bases: &[Base]) -> char {
    let mut mask = 0u8;
    for base in bases {
        mask |= match base {
            Base::A => 1,
            Base::C => 2,
            Base::G => 4,
            Base::T => 8,
        };
    }
    match mask {
        1 => 'A',
        2 => 'C',
        4 => 'G',
        8 => 'T',
        5 => 'R',  // A G
        10 => 'Y', // C T
        6 => 'S',  // C G
        9 => 'W',  // A T
        12 => 'K', // G T
        3 => 'M',  // A C
        14 => 'B', // C G T
        13 => 'D', // A G T
        11 => 'H', // A C T
        7 => 'V',  // A C G
        _ => 'N',
    }
}
