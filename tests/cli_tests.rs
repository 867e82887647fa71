//! Smoke tests for the command-line interface.

use std::io::Write;
use std::process::Command;

use tempfile::NamedTempFile;

fn write_temp(suffix: &str, content: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::with_suffix(suffix).unwrap();
    file.write_all(content).unwrap();
    file.flush().unwrap();
    file
}

fn fixture() -> (NamedTempFile, NamedTempFile) {
    let reference = write_temp(".fa", b">ref\nAAAAAAAAAA\n");
    let samples = write_temp(
        ".fa",
        b">g1\nAAAAAAAAAA\n>g2\nAAAACAAAAA\n>g3\nAAAACGAAAA\n",
    );
    (reference, samples)
}

#[test]
fn test_analyse_json_reports_neighbours_and_clusters() {
    let (reference, samples) = fixture();
    let output = Command::new(env!("CARGO_BIN_EXE_snv-server"))
        .arg("analyse")
        .arg("--reference")
        .arg(reference.path())
        .arg(samples.path())
        .arg("--format")
        .arg("json")
        .output()
        .expect("binary runs");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let g3_neighbours = report["samples"]["g3"]["neighbours"].as_array().unwrap();
    assert_eq!(g3_neighbours.len(), 2);
    // nearest first
    assert_eq!(g3_neighbours[0][0], "g2");
    assert_eq!(g3_neighbours[0][1], 1);

    let clusters = report["clusters"]["snv20"].as_array().unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0]["n_members"], 3);
}

#[test]
fn test_analyse_text_mode() {
    let (reference, samples) = fixture();
    let output = Command::new(env!("CARGO_BIN_EXE_snv-server"))
        .arg("analyse")
        .arg("--reference")
        .arg(reference.path())
        .arg(samples.path())
        .output()
        .expect("binary runs");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("g2: quality 1.000"));
    assert!(stdout.contains("clustering 'snv20'"));
}

#[test]
fn test_msa_command() {
    let (reference, samples) = fixture();
    let output = Command::new(env!("CARGO_BIN_EXE_snv-server"))
        .arg("msa")
        .arg("--reference")
        .arg(reference.path())
        .arg(samples.path())
        .arg("--guids")
        .arg("g1,g2,g3")
        .arg("--format")
        .arg("json")
        .output()
        .expect("binary runs");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["variant_positions"], serde_json::json!([4, 5]));
    assert_eq!(result["rows"]["g3"]["aligned"], "CG");
}

#[test]
fn test_missing_reference_fails() {
    let (_, samples) = fixture();
    let output = Command::new(env!("CARGO_BIN_EXE_snv-server"))
        .arg("analyse")
        .arg("--reference")
        .arg("/nonexistent/ref.fa")
        .arg(samples.path())
        .output()
        .expect("binary runs");
    assert!(!output.status.success());
}
