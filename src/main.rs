use clap::Parser;
use tracing_subscriber::EnvFilter;

use snv_server::cli;

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    // Initialize logging based on verbosity flag
    let filter = if cli.verbose {
        EnvFilter::new("snv_server=debug,info")
    } else {
        EnvFilter::new("snv_server=warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    match cli.command {
        cli::Commands::Analyse(args) => {
            cli::analyse::run(args, cli.format, cli.verbose)?;
        }
        cli::Commands::Msa(args) => {
            cli::msa::run(args, cli.format, cli.verbose)?;
        }
    }

    Ok(())
}
