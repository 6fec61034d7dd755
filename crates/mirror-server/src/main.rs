//! # Call Mirror Server
//!
//! Call-signaling and presence relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file
//! MIRROR_CONFIG=/etc/mirror/mirror.toml mirror
//!
//! # Run with environment variables
//! MIRROR_AUTH__JWT_SECRET=secret MIRROR_PORT=8080 mirror
//!
//! # Share calls between instances through Redis
//! MIRROR_BUS__BACKEND=redis MIRROR_BUS__REDIS_URL=redis://cache:6379 mirror
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mirror=debug,callmirror=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load().context("Failed to load configuration")?;

    tracing::info!(
        "Starting Call Mirror {} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
