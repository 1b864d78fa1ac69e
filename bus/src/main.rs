//! AuthBus broker - main entry point.
//!
//! Serves the partitioned log over HTTP with JSON logging and graceful
//! shutdown on SIGTERM/SIGINT.
//!
//! # Example
//!
//! ```bash
//! # Development mode (no auth)
//! AUTHBUS_UNSAFE_NO_AUTH=true cargo run --bin authbus-broker
//!
//! # Production mode
//! AUTHBUS_PRODUCER_KEYS="auth-service:base64pubkey" \
//! AUTHBUS_CONSUMER_TOKEN="secret-token" \
//! PORT=9400 \
//! cargo run --release --bin authbus-broker
//! ```

use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};

use authbus_bus::broker::{create_router, AppState};
use authbus_bus::config::BrokerConfig;
use authbus_bus::runtime::{init_logging, shutdown_signal};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match BrokerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables (when auth enabled):");
            eprintln!("  AUTHBUS_PRODUCER_KEYS   - Format: source1:pubkey1,source2:pubkey2");
            eprintln!("  AUTHBUS_CONSUMER_TOKEN  - Bearer token for consumers");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                    - HTTP port (default: 9400)");
            eprintln!("  AUTHBUS_PARTITIONS      - Partitions per topic (default: 3)");
            eprintln!("  AUTHBUS_TOPICS          - Topics created at startup");
            eprintln!("  AUTHBUS_UNSAFE_NO_AUTH  - Disable auth (dev only, set to 'true')");
            return ExitCode::from(1);
        }
    };

    let port = config.port;
    info!(
        port,
        auth_mode = if config.unsafe_no_auth { "disabled (UNSAFE)" } else { "enabled" },
        producer_count = config.producer_keys.len(),
        partitions = config.default_partitions,
        topics = ?config.topics,
        "AuthBus broker starting"
    );

    let state = match AppState::new(config) {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "Invalid broker configuration");
            return ExitCode::from(1);
        }
    };
    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(address = %bind_addr, "Broker listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Broker shutdown complete");
    ExitCode::SUCCESS
}
