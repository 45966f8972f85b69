use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod check_config;
mod descramble;
mod serve;

pub use check_config::CheckConfigCommand;
pub use descramble::DescrambleCommand;
pub use serve::ServeCommand;

#[derive(Parser, Debug)]
#[command(name = "casd")]
#[command(about = "Conditional-access descrambling daemon")]
pub struct Args {
    /// Log filter, e.g. `debug` or `cas_cwc=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the CA clients and the admin API (default)
    Serve(ServeCommand),
    /// Descramble a transport stream file
    Descramble(DescrambleCommand),
    /// Validate a configuration file and print its clients
    CheckConfig(CheckConfigCommand),
}

impl Args {
    pub async fn run(self) -> Result<()> {
        init_logging(self.log_level.as_deref());

        let command = self
            .command
            .unwrap_or(Command::Serve(ServeCommand::default()));

        match command {
            Command::Serve(cmd) => cmd.run().await,
            Command::Descramble(cmd) => cmd.run().await,
            Command::CheckConfig(cmd) => cmd.run().await,
        }
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
