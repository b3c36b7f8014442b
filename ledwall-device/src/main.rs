//! ledwall-device — entry point.
//!
//! ```text
//! ledwall-device                    Run with ledwall-device.toml
//! ledwall-device --config <path>    Load a custom config TOML
//! ledwall-device --server <addr>    Override the frame server address
//! ledwall-device --id <mac>         Override the device identity
//! ledwall-device --gen-config       Write default config to stdout
//! ```
//!
//! On a host the pixel clock is simulated and the LED bus only counts
//! what it is sent.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ledwall_core::DeviceId;
use ledwall_device::address::StaticAddress;
use ledwall_device::clock::{CountingBus, SimulatedClock};
use ledwall_device::config::DeviceConfig;
use ledwall_device::controller::DeviceController;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "ledwall-device", about = "LED wall slice controller")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "ledwall-device.toml")]
    config: PathBuf,

    /// Frame server address (overrides config). Example: 10.10.10.1:5050
    #[arg(short, long)]
    server: Option<String>,

    /// Device identity (overrides config). Example: 24-0a-c4-c0-6b-f0
    #[arg(long)]
    id: Option<DeviceId>,

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
    if let Some(addr) = cli.server {
        config.network.server_addr = addr;
    }
    if let Some(id) = cli.id {
        config.device.id = id;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = config.settings()?;
    info!("ledwall-device v{}", env!("CARGO_PKG_VERSION"));
    info!("identity: {}", settings.id);
    info!(
        "slice: {}x{}, jitter buffer {} frames",
        settings.width, settings.leds, settings.depth
    );
    info!("pixel clock: {} scans/s", settings.fps);

    let bus = CountingBus::new();
    let clock = SimulatedClock::for_scan(settings.width, settings.fps);
    let address = StaticAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let controller = DeviceController::new(settings, bus.clone(), clock, Box::new(address));
    let mut status = controller.subscribe();

    let stop = CancellationToken::new();
    let stop_signal = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received; shutting down");
        stop_signal.cancel();
    });

    let reporter = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        loop {
            tick.tick().await;
            let s = status.borrow_and_update().clone();
            info!(
                state = s.state,
                level = s.level,
                shown = s.shown,
                dropped = s.dropped,
                columns = bus.columns(),
                "status"
            );
        }
    });

    controller.run(stop).await;
    reporter.abort();
    if let Err(e) = reporter.await {
        if !e.is_cancelled() {
            warn!("status reporter failed: {e}");
        }
    }
    Ok(())
}
