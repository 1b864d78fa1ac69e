//! AuthBus gateway - main entry point.
//!
//! Authorizes requests against credential and session state, then proxies
//! them to the upstream named by the route table. The gateway's own
//! endpoints live under `/_gateway` so every other path reaches upstreams.
//!
//! # Example
//!
//! ```bash
//! # Local lookup: this gateway consumes session events itself
//! AUTHBUS_JWT_SECRET="shared-secret" \
//! AUTHBUS_BROKER_URL="http://localhost:9400" \
//! AUTHBUS_CONSUMER_TOKEN="secret-token" \
//! cargo run --bin authbus-gateway
//!
//! # Remote lookup: ask the auth service for session state
//! AUTHBUS_JWT_SECRET="shared-secret" \
//! AUTHBUS_SESSION_LOOKUP_URL="http://localhost:3001" \
//! AUTHBUS_INTERNAL_TOKEN="peer-token" \
//! cargo run --bin authbus-gateway
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};

use authbus_bus::runtime::{init_logging, shutdown_signal};
use authbus_bus::BusClient;
use authbus_server::attach::BusAttachment;
use authbus_server::config::{GatewayConfig, SessionLookupMode};
use authbus_server::consumer::SessionEventConsumer;
use authbus_server::credential::CredentialCodec;
use authbus_server::lookup::RemoteLookup;
use authbus_server::routes::{create_gateway_router, GatewayState};
use authbus_server::session::SessionStore;

/// How often inactive sessions past retention are swept.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  AUTHBUS_JWT_SECRET            - Secret shared with the auth service");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                          - HTTP port (default: 4000)");
            eprintln!("  AUTHBUS_ROUTES                - prefix=>target[=>rewrite][;session],...");
            eprintln!("  AUTHBUS_SESSION_LOOKUP_URL    - Remote session owner (default: local)");
            eprintln!("  AUTHBUS_UPSTREAM_TIMEOUT_MS   - Upstream timeout (default: 30000)");
            eprintln!("  AUTHBUS_BROKER_URL            - Event bus broker");
            eprintln!("  AUTHBUS_CONSUMER_TOKEN        - Bearer token for the broker");
            eprintln!("  AUTHBUS_INTERNAL_TOKEN        - Token for /_gateway/internal/sessions");
            eprintln!("                                  (required with AUTHBUS_SESSION_LOOKUP_URL)");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        routes = config.routes.routes().len(),
        session_lookup = ?config.session_lookup,
        upstream_timeout_ms = config.upstream_timeout.as_millis() as u64,
        "AuthBus gateway starting"
    );

    let codec = CredentialCodec::new(config.service.jwt_secret.as_bytes());
    let mut bus = None;
    let mut attach = None;
    let mut eviction = None;

    let state = match &config.session_lookup {
        SessionLookupMode::Local => {
            let client = match BusClient::http(config.service.bus.clone(), None) {
                Ok(client) => Arc::new(client),
                Err(err) => {
                    error!(error = %err, "Invalid bus configuration");
                    return ExitCode::from(1);
                }
            };

            let store = Arc::new(SessionStore::new());
            let consumer = Arc::new(SessionEventConsumer::new(Arc::clone(&store)));

            // Until the consumer catches up every session route denies with
            // `session_not_yet_seen`, so the gateway still starts without a bus.
            attach = Some(
                BusAttachment::new(Arc::clone(&client))
                    .with_consumer(Arc::clone(&consumer), config.service.consumer_group())
                    .spawn(),
            );

            if let Some(retention) = config.service.session_retention {
                eviction = Some(store.spawn_eviction_task(retention, EVICTION_INTERVAL));
                info!(retention_secs = retention.as_secs(), "Session eviction enabled");
            }
            bus = Some(client);

            GatewayState::local(
                config.routes.clone(),
                codec,
                store,
                config.upstream_timeout,
            )
            .map(|state| {
                let state = state.with_consumer(consumer);
                match &config.service.internal_token {
                    Some(token) => state.with_internal_token(token.clone()),
                    None => state,
                }
            })
        }
        SessionLookupMode::Remote(url) => {
            let Some(token) = config.service.internal_token.as_deref() else {
                error!("AUTHBUS_INTERNAL_TOKEN is required for remote session lookup");
                return ExitCode::from(1);
            };
            let lookup = match RemoteLookup::new(url, token) {
                Ok(lookup) => Arc::new(lookup),
                Err(err) => {
                    error!(error = %err, url = %url, "Invalid session lookup URL");
                    return ExitCode::from(1);
                }
            };
            GatewayState::new(config.routes.clone(), codec, lookup, config.upstream_timeout)
        }
    };

    let state = match state {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "Failed to build gateway state");
            return ExitCode::from(1);
        }
    };
    let app = create_gateway_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(address = %bind_addr, "Gateway listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(handle) = attach {
        handle.abort();
    }
    if let Some(handle) = eviction {
        handle.abort();
    }
    if let Some(client) = bus {
        client.disconnect().await;
    }

    if let Err(err) = served {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
