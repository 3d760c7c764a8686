//! sitecrawl CLI: multi-tenant website crawler.
//!
//! Crawls sites through a shared pool of sessions, reduces every page to a
//! minimal semantic form and stores it in a local libSQL database.

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
