mod check;
mod config;
mod logging;
mod pr;
mod report;

use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info, info_span, Instrument};

/// PR Version Resolver — reads a check request (source configuration and the
/// last resolved version) and prints the pull request versions that are new.
#[derive(Parser, Debug)]
#[command(name = "pr-version-resolver", version, about)]
struct Cli {
    /// Read the check request from this file instead of stdin
    #[arg(short, long)]
    request: Option<PathBuf>,

    /// Write the resolved versions to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Operator config file (defaults to ./.pr-version-resolver.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for log files, overriding the config file
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = config::Config::load(cli.config.as_deref())?;
    let log_dir = cli.log_dir.clone().unwrap_or_else(|| config.logging.dir());
    logging::init(&log_dir, config.logging.retention())?;

    let request = report::read_request(cli.request.as_deref())?;
    debug!(
        repository = %request.source.repository,
        previous = %request.version,
        "parsed check request"
    );

    let span = info_span!("check", repository = %request.source.repository);
    let response = async {
        let github = pr::github::GitHub::from_source(&request.source, &config)?;
        let response = check::check(&request, &github).await?;
        Ok::<_, Box<dyn std::error::Error>>(response)
    }
    .instrument(span)
    .await?;

    report::output(&response, cli.output.as_deref())?;
    info!(versions = response.len(), "done");

    Ok(())
}
