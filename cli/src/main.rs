// agentmail — thin launcher for the node daemon and the relay server.

use std::path::PathBuf;

use agentmail_core::config::{NodeConfig, RelayConfig};
use agentmail_core::{node, relay};
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "agentmail")]
#[command(about = "AgentMail — peer-to-peer mail for software agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node daemon
    Node {
        /// Node name; the routing address becomes <name>@<name>.local
        #[arg(short, long, default_value = "my-node")]
        name: String,
        #[arg(short, long, default_value_t = 7443)]
        port: u16,
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(short, long, default_value = "./agentmail_data")]
        data_dir: PathBuf,
        /// Relay base URL, e.g. http://relay.example:7445
        #[arg(short, long, default_value = "")]
        relay: String,
        /// Disable LAN discovery
        #[arg(long)]
        no_mdns: bool,
    },
    /// Run the relay server
    Relay {
        #[arg(short, long, default_value_t = 7445)]
        port: u16,
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(short, long, default_value = "./relay_data")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Node {
            name,
            port,
            host,
            data_dir,
            relay,
            no_mdns,
        } => {
            let config = NodeConfig {
                node_name: name,
                host,
                port,
                data_dir,
                relay_url: relay,
                enable_mdns: !no_mdns,
            };
            let handle = node::start(config).await?;
            tokio::signal::ctrl_c().await?;
            handle.shutdown().await;
        }
        Commands::Relay {
            port,
            host,
            data_dir,
        } => {
            let config = RelayConfig {
                host,
                port,
                data_dir,
            };
            let handle = relay::server::start(&config).await?;
            tokio::signal::ctrl_c().await?;
            handle.shutdown().await;
        }
    }
    Ok(())
}
