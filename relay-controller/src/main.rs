//! Relay controller entry point.
//!
//! ```text
//! relay-controller                      Connect and sync the clipboard
//! relay-controller --send a.txt b.bin   Also upload files to the agent
//! relay-controller --fetch logs/a.log   Download from the agent's share
//! relay-controller --config <path>      Load a custom config TOML
//! relay-controller --address <addr>     Override the agent address
//! relay-controller --gen-config         Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_controller::service::ControllerService;
use relay_core::RelayConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "relay-controller", about = "Relay controller: file upload and clipboard sync")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "relay-controller.toml")]
    config: PathBuf,

    /// Agent address to dial (overrides `network.address`).
    #[arg(short, long)]
    address: Option<String>,

    /// Files to upload once connected.
    #[arg(short, long, num_args = 1..)]
    send: Vec<PathBuf>,

    /// Files to download from the agent's `share_dir` once connected.
    #[arg(short, long, num_args = 1..)]
    fetch: Vec<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", RelayConfig::default_toml()?);
        return Ok(());
    }

    let mut config = RelayConfig::load(&cli.config);
    if let Some(address) = cli.address {
        config.network.address = address;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("relay-controller v{}", env!("CARGO_PKG_VERSION"));
    info!("agent: {}", config.network.address);
    info!("max retries: {}", config.reconnect.max_retries);
    if !cli.send.is_empty() {
        info!("{} file(s) queued for upload", cli.send.len());
    }
    if !cli.fetch.is_empty() {
        info!("{} file(s) to request from the agent", cli.fetch.len());
    }

    let service = ControllerService::new(config)
        .with_uploads(cli.send)
        .with_fetches(cli.fetch);
    let stop = service.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    service.run().await?;

    Ok(())
}
