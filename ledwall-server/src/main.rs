//! ledwall-server — entry point.
//!
//! ```text
//! ledwall-server                    Serve with ledwall-server.toml
//! ledwall-server --config <path>    Load a custom config TOML
//! ledwall-server --listen <addr>    Override the listen address
//! ledwall-server --gen-config       Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ledwall_server::config::ServerConfig;
use ledwall_server::render::{Renderer, Show};
use ledwall_server::server::WallServer;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "ledwall-server", about = "LED wall frame server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "ledwall-server.toml")]
    config: PathBuf,

    /// Listen address, overriding the configuration file.
    #[arg(short, long)]
    listen: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ServerConfig::load(&cli.config);
    if let Some(listen) = cli.listen {
        config.network.listen_addr = listen;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("ledwall-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "wall: {}x{} in slices of {} rows",
        config.wall.width, config.wall.height, config.wall.slice_height
    );
    for (i, id) in config.wall.slices.iter().enumerate() {
        info!("slice {i}: {id}");
    }

    let show = Show::from_config(&config.show.effects);
    let server = WallServer::new(config)?;
    let listener = server.bind().await?;
    let stop = server.shutdown_handle();
    let store = server.store();

    let renderer = Renderer::new(server.store(), server.geometry(), show);
    let render_thread = renderer.spawn(tokio::runtime::Handle::current())?;

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        stop.cancel();
    });

    let result = server.run(listener).await;

    // Already cancelled on a clean stop; an early error leaves it open.
    store.cancel();
    let joined = tokio::task::spawn_blocking(move || render_thread.join()).await?;
    match joined {
        Ok(frames) => info!(frames, "render thread stopped"),
        Err(_) => warn!("render thread panicked"),
    }

    if let Err(e) = &result {
        error!("server error: {e}");
    }
    result?;
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM where available.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("cannot install SIGTERM handler: {e}"),
        }
    }
    tokio::signal::ctrl_c().await.ok();
}
