//! Castlink Daemon - Main entry point
//!
//! Watches USB hotplug events, reconciles them with debug-bridge scans, and
//! serves the resulting device registry over a per-user Unix socket.

use anyhow::Result;
use castlink_daemon::{config, server, state};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "castlinkd")]
#[command(about = "USB device registry and screen mirroring daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "castlink.toml")]
    config: PathBuf,

    /// Socket path (overrides the runtime-directory default)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("castlinkd v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(&args.config)?;
    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }
    let state = state::DaemonState::new(config);

    // Devices attached before the daemon started populate the registry
    // silently; subscribers get them in their initial snapshot.
    match castlink_discovery::enumerate_present() {
        Ok(signals) => {
            info!(count = signals.len(), "enumerated attached usb devices");
            for signal in &signals {
                state.apply_hotplug(signal).await;
            }
        }
        Err(err) => warn!(error = %err, "usb enumeration failed, starting empty"),
    }

    let (hotplug_tx, hotplug_rx) = tokio::sync::mpsc::channel(64);
    castlink_discovery::spawn_watcher(hotplug_tx)?;

    let socket = match args.socket {
        Some(path) => path,
        None => server::socket_path(&state.config.daemon.socket_name)?,
    };
    let listener = server::bind(&socket)?;
    info!(socket = %socket.display(), "serving");

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let result = tokio::select! {
        result = server::run(state, listener, hotplug_rx) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
            Ok(())
        }
    };
    if let Err(err) = std::fs::remove_file(&socket) {
        warn!(error = %err, "failed to remove socket file");
    }
    result
}
