#![warn(unused_crate_dependencies)]

use client::ClientError;
use config::{load_config, VERSION};
use log::{error, info};
use tokio::{select, signal};
use utils::logging;

mod auth;
mod client;
mod config;
mod hub;
mod utils;

#[tokio::main]
async fn main() {
    // Load configuration
    let config = load_config().unwrap_or_default();

    // Initialize logging
    logging::setup(config.logging);

    info!(
        "starting trunkline v{} ({} tunnels to {})",
        VERSION, config.tunnels, config.remote
    );

    select! {
        result = client::start(config) => {
            match result {
                Ok(()) => {}
                // A failed bind is fatal; the panic hook routes the
                // report through the log and exits non-zero
                Err(err @ ClientError::Listen(_)) => panic!("{err}"),
                Err(err) => error!("client failed: {err}"),
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
