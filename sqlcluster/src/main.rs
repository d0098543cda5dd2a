mod api;
mod codec;
mod command;
mod config;
mod engine;
mod metrics;
mod raft;
mod raft_client;
mod raft_service;
mod server;
mod state;

use clap::Parser;
use tokio::signal;

/// A replicated SQL execution cluster node.
#[derive(Parser, Debug)]
#[command(name = "sqlcluster")]
struct Cli {
    /// Path to the runtime config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Override the node id
    #[arg(long)]
    id: Option<u64>,
    /// Override the client listen address
    #[arg(short, long)]
    listen: Option<String>,
    /// Override the data directory
    #[arg(short, long)]
    data: Option<String>,
    /// Leader address of an existing cluster to join at startup
    #[arg(short, long)]
    join: Option<String>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let cli = Cli::parse();

    let mut config = config::RuntimeConfig::from_toml(&cli.config);
    if let Some(id) = cli.id {
        config.id = id;
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(data) = cli.data {
        config.data_path = data;
    }
    if let Some(join) = cli.join {
        config.join = Some(join);
    }
    log::info!(
        "node {} ({}) starting, connection string {}",
        config.id,
        config.name(),
        config.connection_string()
    );

    let server = server::Server::new(config)?;
    server.start().await?;
    shutdown_signal().await;
    server.stop();
    Ok(())
}
