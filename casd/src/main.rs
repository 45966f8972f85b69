use anyhow::Result;
use clap::Parser;

mod cli;
mod clients;
mod config;
mod server;
mod ts_file;

#[tokio::main]
async fn main() -> Result<()> {
    cli::Args::parse().run().await
}
