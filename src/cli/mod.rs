//! Command-line interface for snv-server.
//!
//! This module implements the CLI using clap. Available commands:
//!
//! - **analyse**: Insert a batch of consensus sequences and report
//!   neighbours and clusters
//! - **msa**: Align stored sequences over their informative positions
//!
//! ## Usage
//!
//! ```text
//! # Batch-analyse consensus sequences against a reference
//! snv-server analyse --reference ref.fa samples.fa
//!
//! # With a mask and a server config
//! snv-server analyse --reference ref.fa --mask excluded.txt \
//!     --config server.json samples.fa
//!
//! # JSON output for scripting
//! snv-server analyse --reference ref.fa samples.fa --format json
//!
//! # Alignment of three samples at their variant sites
//! snv-server msa --reference ref.fa samples.fa --guids s1,s2,s3
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::parsing::fasta::{read_fasta, read_reference, FastaRecord};
use crate::persist::MemoryStore;
use crate::seq::MaskSet;
use crate::server::SnvServer;
use crate::ServerConfig;

pub mod analyse;
pub mod msa;

#[derive(Parser)]
#[command(name = "snv-server")]
#[command(version)]
#[command(about = "Sparse SNV distance matrix and clustering over bacterial consensus sequences")]
#[command(
    long_about = "snv-server maintains a sparse pairwise SNV distance matrix over reference-mapped consensus sequences.\n\nEach sequence is compared against the whole collection; only pairs at or below the configured SNV ceiling are kept. On top of the matrix the server maintains single-linkage clusters, mixture flags and multiple sequence alignments."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Insert consensus sequences and report neighbours and clusters
    Analyse(analyse::AnalyseArgs),

    /// Multiple sequence alignment over informative positions
    Msa(msa::MsaArgs),
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Inputs shared by every subcommand.
#[derive(clap::Args)]
pub struct CommonArgs {
    /// Reference genome FASTA (exactly one record)
    #[arg(short, long)]
    pub reference: PathBuf,

    /// File of masked positions, one integer per line
    #[arg(short, long)]
    pub mask: Option<PathBuf>,

    /// Server configuration JSON; defaults apply when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Consensus sequences FASTA; record names become guids
    pub samples: PathBuf,
}

/// Default configuration for ad-hoc batch runs without a config file:
/// a ceiling of 20 SNV and one clustering at the same threshold.
const DEFAULT_CONFIG: &str = r#"{
    "snv_ceiling": 20,
    "clustering": [
        {"name": "snv20", "threshold": 20, "uncertain_char": "n",
         "mixture_policy": "include_mixed"}
    ]
}"#;

/// Build an in-memory server from the common inputs and insert every
/// sample.
///
/// # Errors
///
/// Fails on unreadable input files, invalid configuration, or a sequence
/// the engine rejects.
pub fn build_server(args: &CommonArgs) -> anyhow::Result<(SnvServer, Vec<FastaRecord>)> {
    let reference = read_reference(&args.reference)
        .with_context(|| format!("reading reference {}", args.reference.display()))?;

    let config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            ServerConfig::from_json(&json)?
        }
        None => ServerConfig::from_json(DEFAULT_CONFIG)?,
    };

    let genome_length = reference.len() as u32;
    let mask = match &args.mask {
        Some(path) => MaskSet::from_file(path, genome_length)?,
        None => MaskSet::empty(genome_length),
    };

    let server = SnvServer::open(config, &reference, mask, Arc::new(MemoryStore::new()))?;

    let samples = read_fasta(&args.samples)
        .with_context(|| format!("reading samples {}", args.samples.display()))?;
    for record in &samples {
        server.insert(crate::server::InsertPayload {
            guid: record.name.clone(),
            seq: record.sequence.clone(),
            meta: None,
        })?;
    }
    Ok((server, samples))
}
