//! FASTA input using noodles.
//!
//! Supports both uncompressed and gzip/bgzip compressed files.
//!
//! Supported extensions:
//! - `.fa`, `.fasta`, `.fna` (uncompressed)
//! - `.fa.gz`, `.fasta.gz`, `.fna.gz` (gzip compressed)
//! - `.fa.bgz`, `.fasta.bgz`, `.fna.bgz` (bgzip compressed)

use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::GzDecoder;
use noodles::fasta;

use crate::parsing::ParseError;

/// One named sequence from a FASTA file.
#[derive(Debug, Clone)]
pub struct FastaRecord {
    pub name: String,
    pub sequence: String,
}

/// Check if the path is a gzipped file
#[allow(clippy::case_sensitive_file_extension_comparisons)] // Already lowercased
fn is_gzipped(path: &Path) -> bool {
    let path_str = path.to_string_lossy().to_lowercase();
    path_str.ends_with(".gz") || path_str.ends_with(".bgz")
}

/// Read every record from a FASTA file.
///
/// # Errors
///
/// Returns `ParseError::Io` if the file cannot be read, `ParseError::Fasta`
/// if parsing fails, or `ParseError::InvalidFormat` if the file holds no
/// records.
pub fn read_fasta(path: &Path) -> Result<Vec<FastaRecord>, ParseError> {
    if is_gzipped(path) {
        let file = std::fs::File::open(path)?;
        let decoder = GzDecoder::new(file);
        read_fasta_from(BufReader::new(decoder))
    } else {
        let file = std::fs::File::open(path)?;
        read_fasta_from(BufReader::new(file))
    }
}

/// Read the reference genome: exactly one FASTA record.
///
/// # Errors
///
/// As [`read_fasta`], plus `ParseError::InvalidFormat` when the file holds
/// more than one record; a multi-contig reference is not supported.
pub fn read_reference(path: &Path) -> Result<String, ParseError> {
    let mut records = read_fasta(path)?;
    match records.len() {
        1 => Ok(records.remove(0).sequence),
        n => Err(ParseError::InvalidFormat(format!(
            "reference must hold exactly one sequence, found {n}"
        ))),
    }
}

fn read_fasta_from<R: BufRead>(reader: R) -> Result<Vec<FastaRecord>, ParseError> {
    let mut fasta_reader = fasta::io::Reader::new(reader);
    let mut records = Vec::new();

    for result in fasta_reader.records() {
        let record =
            result.map_err(|e| ParseError::Fasta(format!("failed to parse FASTA record: {e}")))?;
        let name = String::from_utf8_lossy(record.name()).to_string();
        let sequence = String::from_utf8_lossy(record.sequence().as_ref()).to_string();
        records.push(FastaRecord { name, sequence });
    }

    if records.is_empty() {
        return Err(ParseError::InvalidFormat("no sequences found in FASTA file".to_string()));
    }
    Ok(records)
}
