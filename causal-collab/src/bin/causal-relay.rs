//! Standalone relay over in-memory stores.
//!
//! Configured through `CAUSAL_RELAY_*` environment variables, logging
//! through `RUST_LOG`.

use causal_collab::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!("Starting causal relay on {}...", config.bind_addr);

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
