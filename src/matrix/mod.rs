//! The sparse distance index and its persistence.

pub mod sparse;

pub use sparse::{EdgeRecord, Neighbour, SparseMatrix};
