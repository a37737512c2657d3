//! nexus-agent binary

use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nexus_agent::{Agent, AgentConfig, AgentPaths};

#[derive(Debug, Parser)]
#[command(name = "nexus-agent", version, about = "SSH trust agent for the nexus control plane")]
struct Cli {
    /// Control-plane address
    #[arg(long, default_value = "127.0.0.1")]
    server: String,

    /// Control-plane agent port
    #[arg(long, default_value_t = 8091)]
    port: u16,

    /// Rebase every managed path under this directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal.cancel();
        }
    });

    let agent = Agent::new(
        AgentConfig {
            server: cli.server,
            port: cli.port,
        },
        AgentPaths::new(cli.root),
    );
    agent.run(shutdown).await?;
    Ok(())
}
