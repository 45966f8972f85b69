use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::config::Config;

#[derive(Parser, Debug)]
pub struct CheckConfigCommand {
    /// Configuration file (YAML)
    #[arg(short, long, default_value = "casd.yaml")]
    pub config: PathBuf,
}

impl CheckConfigCommand {
    pub async fn run(self) -> Result<()> {
        let config = Config::load(&self.config)?;

        println!("Admin API: {}", config.admin.listen);
        if let Some(size) = config.cluster_size {
            println!("Cluster size: {size}");
        }
        if config.clients.is_empty() {
            println!("No clients configured");
            return Ok(());
        }

        println!();
        for client in &config.clients {
            let state = if client.enabled() { "" } else { " (disabled)" };
            println!(
                "  {:<16} {:<6} {}{}",
                client.id(),
                client.kind().to_string(),
                client.describe(),
                state
            );
        }

        Ok(())
    }
}
