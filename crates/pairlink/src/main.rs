//! `pairlink-relay`: runs the relay server.
//!
//! Reads `PAIRLINK_BIND` and `PAIRLINK_REQUIRE_DEVICE_TOKEN`; log levels
//! come from `RUST_LOG` (default `info`).

use pairlink::{PairlinkError, RelayServer, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), PairlinkError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env()?;
    let server = RelayServer::builder().config(config).build().await?;
    tracing::info!(addr = %server.local_addr()?, "listening");
    server.run().await
}
