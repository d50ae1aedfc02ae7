use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tether::config::ServerConfig;
use tether::server;

#[derive(Parser)]
#[command(name = "tether")]
#[command(version, about = "Coordination server for remote-driven coding-agent sessions")]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordination server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Root of the durable state tree
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Agent CLI binary to invoke per execution
        #[arg(long)]
        agent_cmd: Option<String>,

        /// Path to a tether.toml config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind on all interfaces with permissive CORS
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "tether=debug" } else { "tether=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            port,
            data_dir,
            agent_cmd,
            config,
            dev,
        } => {
            let mut server_config = ServerConfig::load(config.as_deref())?;
            if let Some(port) = port {
                server_config.port = port;
            }
            if let Some(data_dir) = data_dir {
                server_config.data_dir = data_dir;
            }
            if let Some(agent_cmd) = agent_cmd {
                server_config.agent_cmd = agent_cmd;
            }
            if dev {
                server_config.dev_mode = true;
            }
            server::start_server(server_config).await
        }
    }
}
