//! quorumkv node binary

use clap::{Parser, Subcommand};
use quorumkv::{server::Node, Config};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "quorumkv-node")]
#[command(about = "Replicated key/value node with Raft consensus and standalone fallback")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Serve {
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Node ID (overrides the file)
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP (overrides the file)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Data directory (overrides the file)
        #[arg(long)]
        data: Option<PathBuf>,
    },
    /// Validate a configuration file and print the result
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            bind,
            data,
        } => {
            let mut config = Config::load_unvalidated(config.as_deref())?;
            // CLI has priority over file and environment
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(data) = data {
                config.data_dir = data;
            }
            config.validate()?;

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            Node::new(config).serve().await?;
        }
        Commands::CheckConfig { config } => {
            let config = Config::load(Some(&config))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
