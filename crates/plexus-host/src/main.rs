//! Plexus host - runs the extension runtime and serves the UI bridge.
//!
//! Prints `BRIDGE_PORT=<port>` on stdout once the bridge is listening. Logs
//! go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use plexus_core::config::{AppConfig, BackendTimings};
use plexus_core::{BackendConfig, BridgeServer, PlexusRuntime};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "plexus-host")]
#[command(about = "Extension runtime host for the Plexus assistant")]
struct Args {
    /// Bridge port (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Data directory (defaults to the platform data dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Model-serving backend executable; enables the inference extension
    #[arg(long)]
    backend: Option<PathBuf>,

    /// Port the backend listens on
    #[arg(long, default_value_t = BackendTimings::DEFAULT_PORT)]
    backend_port: u16,

    /// JSON file with a full backend configuration; overrides --backend
    #[arg(long)]
    backend_config: Option<PathBuf>,
}

fn init_logging(args: &Args) {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn backend_config(args: &Args) -> Result<Option<BackendConfig>> {
    if let Some(path) = &args.backend_config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading backend config {}", path.display()))?;
        let config: BackendConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing backend config {}", path.display()))?;
        return Ok(Some(config));
    }
    Ok(args
        .backend
        .as_ref()
        .map(|exe| BackendConfig::new(exe).with_port(args.backend_port)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting {} host", AppConfig::APP_NAME);

    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::data_dir()
            .context("no platform data directory; pass --data-dir")?
            .join(AppConfig::DATA_DIR_NAME),
    };
    info!("Data directory: {}", data_dir.display());

    let mut builder = PlexusRuntime::builder(&data_dir);
    if let Some(config) = backend_config(&args)? {
        info!("Backend: {}", config.executable.display());
        builder = builder.with_backend(config);
    }
    let runtime = Arc::new(builder.build()?);

    let known = runtime.init().await?;
    let active = runtime.load().await?;
    info!("{} extensions registered, {} active", known, active.len());

    let mut server = BridgeServer::start_on(runtime.clone(), args.port).await?;

    // Read by the UI process; must stay the only line on stdout.
    println!("BRIDGE_PORT={}", server.addr().port());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    server.shutdown();
    if let Err(e) = runtime.teardown().await {
        warn!("Teardown failed: {}", e);
    }
    Ok(())
}
