//! Standalone broadcast relay for board-sync clients.
//!
//! `BOARD_SYNC_RELAY_ADDR` overrides the bind address, `RUST_LOG` the verbosity.

use board_sync::{RelayConfig, RelayServer};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = RelayConfig::default();
    if let Ok(addr) = std::env::var("BOARD_SYNC_RELAY_ADDR") {
        config.bind_addr = addr;
    }
    info!("Starting board-sync relay on {}", config.bind_addr);

    let relay = RelayServer::new(config);
    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            relay.shutdown();
        }
    }
}
