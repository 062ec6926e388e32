use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod middleware;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "weaver")]
#[command(about = "Workflow DAG engine for provisioning AI resources", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "weaver.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on, overrides the configuration file
    #[arg(short, long, env = "WEAVER_PORT")]
    port: Option<u16>,

    /// Host to bind to, overrides the configuration file
    #[arg(long, env = "WEAVER_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weaver=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting Weaver workflow engine");
    tracing::info!("Data directory: {}", args.data_dir.display());

    // Load configuration
    let mut config = ServerConfig::load(&args.config, args.data_dir)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // Start API server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, config).await?;

    Ok(())
}
