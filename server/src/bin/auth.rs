//! AuthBus auth service - main entry point.
//!
//! Issues credentials on login and publishes `LOGIN`/`LOGOUT` events. It
//! also consumes those events into its own session store, which gateways in
//! remote lookup mode query.
//!
//! # Example
//!
//! ```bash
//! AUTHBUS_JWT_SECRET="shared-secret" \
//! AUTHBUS_USERS_FILE="./users.json" \
//! AUTHBUS_BROKER_URL="http://localhost:9400" \
//! AUTHBUS_SIGNING_KEY="base64-ed25519-seed" \
//! AUTHBUS_CONSUMER_TOKEN="secret-token" \
//! cargo run --bin authbus-auth
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use authbus_bus::runtime::{init_logging, shutdown_signal};
use authbus_bus::signer::ProducerSigner;
use authbus_bus::BusClient;
use authbus_server::attach::BusAttachment;
use authbus_server::auth_service::{create_auth_router, AuthState, UserDirectory};
use authbus_server::config::AuthServiceConfig;
use authbus_server::consumer::SessionEventConsumer;
use authbus_server::credential::CredentialCodec;
use authbus_server::producer::SessionEventProducer;
use authbus_server::session::SessionStore;

const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match AuthServiceConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  AUTHBUS_JWT_SECRET                - Secret shared with gateways");
            eprintln!("  AUTHBUS_USERS_FILE                - JSON array of users");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                              - HTTP port (default: 3001)");
            eprintln!("  AUTHBUS_CREDENTIAL_LIFETIME_SECS  - Credential lifetime (default: 86400)");
            eprintln!("  AUTHBUS_BROKER_URL                - Event bus broker");
            eprintln!("  AUTHBUS_SIGNING_KEY               - Ed25519 key for publishing");
            eprintln!("  AUTHBUS_INTERNAL_TOKEN            - Enables /internal/sessions for gateways");
            return ExitCode::from(1);
        }
    };

    let (state, bus) = match build_state(&config) {
        Ok(built) => built,
        Err(err) => {
            error!(error = format!("{err:#}"), "Failed to start auth service");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        users = state.users.len(),
        credential_lifetime_secs = config.credential_lifetime.as_secs(),
        "AuthBus auth service starting"
    );

    if state.internal_token.is_none() {
        info!("No internal token configured, /internal/sessions is disabled");
    }

    // Logins keep working and report `event_published: false` until attached.
    let attach = BusAttachment::new(Arc::clone(&bus))
        .with_topics(state.producer.clone())
        .with_consumer(Arc::clone(&state.consumer), config.service.consumer_group())
        .spawn();
    let eviction: Option<JoinHandle<()>> = config
        .service
        .session_retention
        .map(|retention| state.store().spawn_eviction_task(retention, EVICTION_INTERVAL));

    let app = create_auth_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(address = %bind_addr, "Auth service listening");
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

    attach.abort();
    if let Some(handle) = eviction {
        handle.abort();
    }
    bus.disconnect().await;

    if let Err(err) = served {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Auth service shutdown complete");
    ExitCode::SUCCESS
}

fn build_state(config: &AuthServiceConfig) -> Result<(AuthState, Arc<BusClient>)> {
    let users = UserDirectory::load(&config.users_file)
        .with_context(|| format!("loading users from {}", config.users_file.display()))?;
    if users.is_empty() {
        warn!("Users file is empty, every login will fail");
    }

    let lifetime = chrono::Duration::from_std(config.credential_lifetime)
        .context("credential lifetime out of range")?;
    let codec = CredentialCodec::new(config.service.jwt_secret.as_bytes()).with_lifetime(lifetime);

    let signer = ProducerSigner::from_env().context("reading producer signing key")?;
    if signer.is_none() {
        warn!("No signing key configured, publishes are unsigned");
    }
    let bus = Arc::new(
        BusClient::http(config.service.bus.clone(), signer).context("configuring event bus")?,
    );

    let store = Arc::new(SessionStore::new());
    let state = AuthState {
        users: Arc::new(users),
        codec,
        producer: SessionEventProducer::new(Arc::clone(&bus)),
        consumer: Arc::new(SessionEventConsumer::new(store)),
        internal_token: config.service.internal_token.clone(),
        start_time: Instant::now(),
    };
    Ok((state, bus))
}
