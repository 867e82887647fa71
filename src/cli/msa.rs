//! The `msa` subcommand: align stored sequences over their informative
//! positions.

use crate::cli::{build_server, CommonArgs, OutputFormat};
use crate::core::types::{Guid, UncertainChar};

#[derive(clap::Args)]
pub struct MsaArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Comma-separated guids to align; all samples when omitted
    #[arg(short, long, value_delimiter = ',')]
    pub guids: Option<Vec<String>>,

    /// Characters counted as uncertain in the row statistics
    #[arg(short, long, value_enum, default_value = "n")]
    pub uncertain: UncertainArg,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum UncertainArg {
    N,
    M,
    NOrM,
}

impl From<UncertainArg> for UncertainChar {
    fn from(arg: UncertainArg) -> Self {
        match arg {
            UncertainArg::N => Self::N,
            UncertainArg::M => Self::M,
            UncertainArg::NOrM => Self::NOrM,
        }
    }
}

/// Run the msa command.
///
/// # Errors
///
/// Fails on unreadable inputs, unknown guids or an engine error.
pub fn run(args: MsaArgs, format: OutputFormat, verbose: bool) -> anyhow::Result<()> {
    let (server, samples) = build_server(&args.common)?;

    let guids: Vec<Guid> = match &args.guids {
        Some(names) => names.iter().map(|n| Guid::new(n.clone())).collect(),
        None => samples.iter().map(|r| Guid::new(r.name.clone())).collect(),
    };

    let result = server.multiple_alignment(&guids, Some(args.uncertain.into()))?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Text => {
            println!(
                "{} informative position(s): {:?}",
                result.variant_positions.len(),
                result.variant_positions
            );
            for (guid, row) in &result.rows {
                println!("{guid}\t{}", row.aligned);
                if verbose {
                    println!(
                        "    uncertain in alignment: {}/{}, p3 = {:?}",
                        row.align_uncertain,
                        result.variant_positions.len(),
                        row.p_value3
                    );
                }
            }
            for guid in &result.invalid_guids {
                println!("{guid}\t(excluded: invalid)");
            }
        }
    }
    Ok(())
}
