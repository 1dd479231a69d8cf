//! ReconPipe CLI — multi-stage contact reconnaissance pipeline.
//!
//! Discovers related domains, enumerates contacts for a domain, scrapes and
//! mines their public sources, and synthesizes profiles and pretext drafts.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
