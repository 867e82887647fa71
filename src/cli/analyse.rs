//! The `analyse` subcommand: batch insert plus neighbour and cluster
//! reports.

use serde_json::json;

use crate::cli::{build_server, CommonArgs, OutputFormat};
use crate::core::types::{Guid, NeighbourFormat};

#[derive(clap::Args)]
pub struct AnalyseArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Neighbour threshold; defaults to the configured SNV ceiling
    #[arg(short, long)]
    pub threshold: Option<u32>,

    /// Minimum partner quality for reported neighbours
    #[arg(short = 'q', long, default_value = "0.8")]
    pub quality_cutoff: f64,
}

/// Run the analyse command.
///
/// # Errors
///
/// Fails on unreadable inputs or an engine error.
pub fn run(args: AnalyseArgs, format: OutputFormat, verbose: bool) -> anyhow::Result<()> {
    let (server, samples) = build_server(&args.common)?;
    let threshold = match args.threshold {
        Some(t) => t.min(server.snp_ceiling()?),
        None => server.snp_ceiling()?,
    };

    match format {
        OutputFormat::Json => {
            let mut report = serde_json::Map::new();
            for record in &samples {
                let guid = Guid::new(record.name.clone());
                let neighbours = server.neighbours_within(
                    &guid,
                    threshold,
                    args.quality_cutoff,
                    NeighbourFormat::IdDistanceQuality,
                )?;
                report.insert(
                    record.name.clone(),
                    json!({
                        "annotation": server.annotation(&guid)?,
                        "neighbours": neighbours,
                    }),
                );
            }
            let mut clusters = serde_json::Map::new();
            for contents in cluster_report(&server)? {
                clusters.insert(contents.0, contents.1);
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "samples": report,
                    "clusters": clusters,
                }))?
            );
        }
        OutputFormat::Text => {
            for record in &samples {
                let guid = Guid::new(record.name.clone());
                let annotation = server.annotation(&guid)?;
                let quality = annotation["quality"].as_f64().unwrap_or(0.0);
                if annotation["invalid"].as_bool().unwrap_or(false) {
                    println!("{}: INVALID (quality {quality:.3})", record.name);
                    continue;
                }
                let neighbours = server.neighbours_within(
                    &guid,
                    threshold,
                    args.quality_cutoff,
                    NeighbourFormat::IdDistance,
                )?;
                println!(
                    "{}: quality {quality:.3}, {} neighbour(s) within {threshold} SNV",
                    record.name,
                    neighbours.len()
                );
                if verbose {
                    for row in &neighbours {
                        println!("    {} ({} SNV)", row[0].as_str().unwrap_or("?"), row[1]);
                    }
                }
            }
            for (algorithm, value) in cluster_report(&server)? {
                println!("\nclustering '{algorithm}':");
                if let Some(rows) = value.as_array() {
                    for row in rows {
                        println!(
                            "    cluster {}: {} member(s), {} mixed",
                            row["cluster_id"], row["n_members"], row["n_mixed"]
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

fn cluster_report(
    server: &crate::server::SnvServer,
) -> anyhow::Result<Vec<(String, serde_json::Value)>> {
    let mut report = Vec::new();
    for algorithm in server.clustering_algorithms()? {
        if let Ok(summary) = server.cluster_summary(&algorithm) {
            report.push((algorithm, serde_json::to_value(summary)?));
        }
    }
    Ok(report)
}
