//! Core Hub - Entry Point
//!
//! Loads config (`--config <path>`, else `COREHUB_CONFIG`, else built-in
//! defaults), installs logging, starts the hub, and runs until ctrl-c.

use corehub::{logging, ConfigTree, Hub};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Core Hub v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: corehub [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --config <path>  Config file (JSON or YAML)");
        println!("  --help, -h       Show this help");
        println!();
        println!("Environment variables:");
        println!("  COREHUB_CONFIG   Config file path (when --config is absent)");
        println!("  RUST_LOG         Log filter override");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1).cloned())
        .or_else(|| std::env::var("COREHUB_CONFIG").ok());

    let config = match config_path {
        Some(path) => ConfigTree::load(path)?,
        None => ConfigTree::defaults(),
    };

    logging::init(&config.logging())?;

    let hub = Hub::new(&config)?;
    hub.start().await?;
    info!("Core Hub v{} running, ctrl-c to stop", env!("CARGO_PKG_VERSION"));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    hub.stop().await;

    Ok(())
}
