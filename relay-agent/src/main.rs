//! Relay agent entry point.
//!
//! ```text
//! relay-agent                    Serve in the foreground
//! relay-agent --config <path>    Load a custom config TOML
//! relay-agent --address <addr>   Override the bind address
//! relay-agent --gen-config       Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_agent::service::AgentService;
use relay_core::RelayConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "relay-agent", about = "Relay agent: file transfer and clipboard sync")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "relay-agent.toml")]
    config: PathBuf,

    /// Address to listen on (overrides `network.address`).
    #[arg(short, long)]
    address: Option<String>,

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

    info!("relay-agent v{}", env!("CARGO_PKG_VERSION"));
    info!("address: {}", config.network.address);
    info!("download dir: {}", config.transfer.download_dir.display());
    match &config.transfer.share_dir {
        Some(dir) => info!("share dir: {}", dir.display()),
        None => info!("share dir: none (file requests refused)"),
    }
    info!("clipboard sync: {}", config.clipboard.enabled);

    let service = AgentService::new(config);
    let stop = service.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    service.run().await?;

    Ok(())
}
