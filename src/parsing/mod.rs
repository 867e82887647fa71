//! Parsers for the file inputs the CLI consumes.
//!
//! - **FASTA files**: the reference genome (one record) and batches of
//!   reference-mapped consensus sequences (one record per sample, record
//!   name used as the guid). Gzip and bgzip compressed input is supported.

pub mod fasta;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FASTA parse error: {0}")]
    Fasta(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),
}
