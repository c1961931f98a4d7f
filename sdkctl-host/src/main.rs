//! sdkctl-host: SDK controller client.
//!
//! ```text
//! sdkctl-host                          Connect with sdkctl-host.toml or defaults
//! sdkctl-host --service multi-touch    Claim another service
//! sdkctl-host -m hello -m world        Send messages once the port is enabled
//! sdkctl-host --query rate --exit      Send a query and exit after the reply
//! sdkctl-host --gen-config             Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::task::LocalSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sdkctl_host::client::{self, Plan};
use sdkctl_host::config::HostConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "sdkctl-host", about = "SDK controller host client")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "sdkctl-host.toml")]
    config: PathBuf,

    /// Service port, overriding the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Service name, overriding the config file.
    #[arg(short, long)]
    service: Option<String>,

    /// Message payload to send once the port is enabled (repeatable).
    #[arg(short, long = "message")]
    messages: Vec<String>,

    /// Message type for `--message`.
    #[arg(long, default_value_t = 1)]
    message_type: i32,

    /// Query payload to send once the port is enabled.
    #[arg(short, long)]
    query: Option<String>,

    /// Exit once every message came back and the query finished.
    #[arg(long)]
    exit: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&HostConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = HostConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(service) = cli.service {
        config.service.name = service;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("sdkctl-host v{}", env!("CARGO_PKG_VERSION"));
    info!("service: {} on port {}", config.service.name, config.network.port);

    let plan = Plan {
        messages: cli.messages,
        message_type: cli.message_type,
        query: cli.query,
        exit_when_done: cli.exit,
    };
    let summary = LocalSet::new().run_until(client::run(&config, plan)).await?;
    info!(
        "done: {} messages, {} replies, {} failed queries, {} reconnects",
        summary.messages.len(),
        summary.replies.len(),
        summary.failed_queries,
        summary.reconnects
    );
    Ok(())
}
