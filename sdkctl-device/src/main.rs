//! sdkctl-device: mock SDK controller service.
//!
//! ```text
//! sdkctl-device                  Serve with sdkctl-device.toml or defaults
//! sdkctl-device --config <path>  Load a custom config TOML
//! sdkctl-device --port <port>    Override the listen port
//! sdkctl-device --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sdkctl_device::config::DeviceConfig;
use sdkctl_device::service::DeviceService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "sdkctl-device", about = "Mock SDK controller service")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "sdkctl-device.toml")]
    config: PathBuf,

    /// Listen port, overriding the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&DeviceConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = DeviceConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.listen_port = port;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("sdkctl-device v{}", env!("CARGO_PKG_VERSION"));
    info!("services: {}", config.services.names.join(", "));

    let service = DeviceService::new(config);
    let stop = service.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;
    Ok(())
}
