use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use instant_mongo_explorer::config::Config;
use instant_mongo_explorer::mcp::McpServer;
use instant_mongo_explorer::InstantMongo;

/// A Model Context Protocol (MCP) server for throwaway `MongoDB` instances.
///
/// Starts and stops an ephemeral mongod, and lets LLMs browse databases, collections,
/// indexes and sample documents of it and of any configured connection.
/// It communicates via JSON-RPC 2.0 over stdin/stdout.
#[derive(Parser)]
#[command(name = "instant-mongo-explorer")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "MCP server for an ephemeral MongoDB and a topology explorer", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start the ephemeral server right away
    #[arg(long)]
    start_server: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "instant_mongo_explorer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_file()?,
    };
    let config = Config::load_from(&config_path)?;
    tracing::info!("Configuration loaded from {:?}", config_path);
    tracing::info!("Configured connections: {}", config.connections.len());

    let app = Arc::new(InstantMongo::from_config(config).with_config_path(config_path));
    app.init().await;

    if cli.start_server {
        if let Err(e) = app.start_server().await {
            tracing::error!("{}", e.detailed());
        }
    }

    let mcp_server = McpServer::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"), app.clone());
    let result = mcp_server.run().await;

    app.terminate().await;
    result
}
