use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cas_core::{Registry, des_ncb_factory_sized};
use clap::Parser;
use tokio::{signal, sync::watch};
use tracing::{error, info};

use crate::clients::build_client;
use crate::config::Config;

#[derive(Parser, Debug)]
pub struct ServeCommand {
    /// Configuration file (YAML)
    #[arg(short, long, default_value = "casd.yaml")]
    pub config: PathBuf,

    /// Admin API address, overrides the configuration file
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,
}

impl Default for ServeCommand {
    fn default() -> Self {
        Self {
            config: PathBuf::from("casd.yaml"),
            listen: None,
        }
    }
}

impl ServeCommand {
    pub async fn run(self) -> Result<()> {
        let config = Config::load(&self.config)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registry = Arc::new(match config.cluster_size {
            Some(size) => Registry::with_cipher(des_ncb_factory_sized(size)),
            None => Registry::new(),
        });

        for client in config.clients {
            let id = client.id().to_string();
            registry
                .add_client(build_client(client, registry.activity()))
                .with_context(|| format!("adding client '{id}'"))?;
        }
        info!(clients = registry.clients().len(), "clients configured");

        let addr = self.listen.unwrap_or(config.admin.listen);
        let server_handle = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                if let Err(e) = crate::server::run_server(addr, registry, shutdown_rx).await {
                    error!(error = %e, "admin server failed");
                }
            })
        };
        info!(%addr, "admin API listening");

        signal::ctrl_c().await?;
        info!("shutting down");

        let _ = shutdown_tx.send(true);
        let _ = server_handle.await;
        registry.shutdown().await;

        Ok(())
    }
}
