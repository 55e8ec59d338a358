use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod capabilities;
mod config;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "dagrun")]
#[command(about = "Workflow DAG execution engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "dagrun.toml", env = "DAGRUN_CONFIG")]
    config: PathBuf,

    /// Data directory for event logs
    #[arg(short, long, default_value = "./data", env = "DAGRUN_DATA_DIR")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dagrun=info,dagrun_core=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting dagrun {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = ServerConfig::load(&args.config, args.data_dir)?;

    let addr = format!("{}:{}", args.host, args.port);
    api::serve(&addr, config).await?;

    Ok(())
}
