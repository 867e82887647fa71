//! # snv-server
//!
//! A library for maintaining a sparse pairwise SNV distance matrix over a
//! growing collection of reference-mapped bacterial consensus sequences.
//!
//! Outbreak surveillance needs to answer one question quickly: which of
//! the sequences we already hold is this new isolate related to? Computing
//! a full distance matrix is quadratic and almost entirely wasted work,
//! because nearly all pairs are far apart. This crate stores every
//! sequence reference-compressed, compares each new arrival against the
//! whole collection with early termination, and keeps only the pairs at
//! or below a configured SNV ceiling.
//!
//! ## Features
//!
//! - **Reference compression**: sequences are stored as difference sets
//!   against a fixed reference, with an optional second delta against a
//!   nearby stored sequence ("double-delta")
//! - **Thresholded sparse matrix**: neighbour queries, persisted edges,
//!   stable ordering
//! - **Mixture detection**: binomial tests flag samples that look like
//!   two genotypes sequenced as one
//! - **Single-linkage clustering**: incremental, mixture-aware, with
//!   stable cluster ids and a change-id for delta polling
//! - **Pluggable persistence**: the engine writes self-describing records
//!   through a small key-value port
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use snv_server::{InsertPayload, MaskSet, MemoryStore, ServerConfig, SnvServer};
//!
//! let config = ServerConfig::from_json(r#"{"snv_ceiling": 3}"#).unwrap();
//! let server = SnvServer::open(
//!     config,
//!     "AAAAAAAAAA",
//!     MaskSet::empty(10),
//!     Arc::new(MemoryStore::new()),
//! )
//! .unwrap();
//!
//! server
//!     .insert(InsertPayload { guid: "s1".into(), seq: "AAAAAAAAAA".into(), meta: None })
//!     .unwrap();
//! server
//!     .insert(InsertPayload { guid: "s2".into(), seq: "AAAACAAAAA".into(), meta: None })
//!     .unwrap();
//!
//! let neighbours = server
//!     .neighbours_within(&"s1".into(), 3, 0.0, snv_server::NeighbourFormat::IdDistance)
//!     .unwrap();
//! assert_eq!(neighbours.len(), 1);
//! ```
//!
//! ## Modules
//!
//! - [`core`]: identifiers, configuration and the error taxonomy
//! - [`seq`]: masking, the two-stage codec and the compressed store
//! - [`compare`]: pairwise distances, alignment and mixture statistics
//! - [`matrix`]: the sparse thresholded distance index
//! - [`cluster`]: incremental single-linkage clustering
//! - [`persist`]: the durable key-value port
//! - [`server`]: the assembled engine and its method surface
//! - [`parsing`]: FASTA input for the CLI
//! - [`cli`]: command-line interface implementation

pub mod cli;
pub mod cluster;
pub mod compare;
pub mod core;
pub mod matrix;
pub mod parsing;
pub mod persist;
pub mod seq;
pub mod server;
pub mod utils;

// Re-export commonly used types for convenience
pub use cluster::{ClusterSummary, Clusterer, GuidClusterEntry};
pub use compare::{Comparer, MixtureVerdict, MsaBuilder, MsaResult, PairDetail};
pub use core::config::{ClusteringConfig, ServerConfig};
pub use core::errors::CoreError;
pub use core::types::{ClusterId, Guid, MixturePolicy, NeighbourFormat, UncertainChar};
pub use matrix::SparseMatrix;
pub use persist::{MemoryStore, PersistencePort};
pub use seq::{CompressedSequence, CompressedStore, MaskSet, ReferenceCodec};
pub use server::{InsertOutcome, InsertPayload, InsertReport, SnvServer};
