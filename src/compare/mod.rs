//! Pairwise comparison engine: SNV distances, multiple sequence alignment
//! and mixture detection on compressed sequences.

pub mod distance;
pub mod mixture;
pub mod msa;
pub mod stats;

pub use distance::{Comparer, PairDetail};
pub use mixture::MixtureVerdict;
pub use msa::{MsaBuilder, MsaResult, MsaRow};
