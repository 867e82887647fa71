//! Incremental single-linkage clustering over the sparse matrix.

pub mod clusterer;
pub mod dsu;

pub use clusterer::{ClusterStateRecord, ClusterSummary, Clusterer, GuidClusterEntry};
pub use dsu::DisjointSet;
