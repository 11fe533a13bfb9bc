use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod handlers;
mod output;

use cli::Cli;
use output::output_error;

pub(crate) const CLI_SCHEMA_VERSION: &str = "mailsync.cli.v1";
const LOG_ENV_VAR: &str = "MAILSYNC_LOG";

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the JSON envelope.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let rt = tokio::runtime::Runtime::new()?;
    if let Err(err) = rt.block_on(handlers::run_cli(cli)) {
        output_error(&format!("{:#}", err))?;
        std::process::exit(1);
    }
    Ok(())
}
