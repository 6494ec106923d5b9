//! Sidewinderd - Main Entry Point
//!
//! Loads the configuration, binds every supported keyboard and follows
//! hot-plug events until SIGINT or SIGTERM.

use sidewinderd::config::{ConfigManager, DEFAULT_CONFIG_PATH};
use sidewinderd::{DeviceManager, UdevBackend};
use sidewinderd_common::tracing;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let mut config_manager = ConfigManager::new(&config_path);
    let load_result = config_manager.load_config().await;
    let config = config_manager.config().clone();

    tracing_subscriber::fmt()
        .with_max_level(config.log_level())
        .with_target(false)
        .init();

    if let Err(e) = load_result {
        error!("Invalid configuration {}: {}", config_path, e);
        return Err(e.into());
    }

    info!("Starting Sidewinderd v{}", env!("CARGO_PKG_VERSION"));

    if !nix::unistd::Uid::effective().is_root() {
        warn!("Not running as root, hidraw and uinput access may be denied");
    }

    let running = Arc::new(AtomicBool::new(true));
    let settings = config.keyboard_settings();
    info!("Macros are stored in {}", settings.workdir.display());

    let mut manager = DeviceManager::new(Arc::new(UdevBackend), settings, running.clone());
    let mut monitor = tokio::task::spawn_blocking(move || manager.monitor());

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    let result = tokio::select! {
        _ = terminate.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
            None
        }
        _ = interrupt.recv() => {
            info!("Received SIGINT, shutting down gracefully");
            None
        }
        result = &mut monitor => Some(result),
    };

    running.store(false, Ordering::Relaxed);
    let result = match result {
        Some(result) => result,
        None => monitor.await,
    };

    match result {
        Ok(Ok(())) => {
            info!("Sidewinderd shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Device monitor failed: {}", e);
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
