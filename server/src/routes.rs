//! HTTP surface of the gateway.
//!
//! The gateway serves its own endpoints under the reserved [`GATEWAY_PREFIX`]
//! so they never hide an upstream path:
//!
//! - `GET /_gateway/health` - Liveness, route count and session counters
//! - `GET /_gateway/internal/sessions/{user_id}` - Session view, in local
//!   lookup mode with an internal token configured
//! - everything else - Authorized and proxied per the route table
//!
//! Paths are normalized before routing, so `/api/auth/../private` is routed
//! and authorized as `/api/private`. Paths with backslashes or encoded
//! slashes are rejected with 400.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use authbus_server::credential::CredentialCodec;
//! use authbus_server::routes::{create_gateway_router, GatewayState};
//! use authbus_server::routing::RouteTable;
//! use authbus_server::session::SessionStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(SessionStore::new());
//!     let state = GatewayState::local(
//!         RouteTable::default(),
//!         CredentialCodec::new(b"secret"),
//!         store,
//!         Duration::from_secs(30),
//!     )
//!     .expect("failed to build gateway state");
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:4000").await.unwrap();
//!     axum::serve(listener, create_gateway_router(state)).await.unwrap();
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::consumer::{ConsumerStats, SessionEventConsumer};
use crate::credential::CredentialCodec;
use crate::error::Result;
use crate::gateway::{Authorizer, Verdict};
use crate::lookup::{session_router, LocalLookup, SessionLookup};
use crate::proxy::Proxy;
use crate::routing::{normalize_path, RouteTable};
use crate::session::{SessionStats, SessionStore};

/// Shared gateway state.
#[derive(Clone)]
pub struct GatewayState {
    pub routes: Arc<RouteTable>,
    pub authorizer: Authorizer,
    pub proxy: Proxy,

    /// Present in local lookup mode.
    pub store: Option<Arc<SessionStore>>,
    pub consumer: Option<Arc<SessionEventConsumer>>,

    /// Enables the session endpoint in local mode.
    pub internal_token: Option<String>,
    pub start_time: Instant,
}

/// Prefix of the paths the gateway answers itself.
pub const GATEWAY_PREFIX: &str = "/_gateway";

impl GatewayState {
    /// # Errors
    ///
    /// Returns [`crate::error::ServerError::Internal`] if the proxy client
    /// cannot be built.
    pub fn new(
        routes: RouteTable,
        codec: CredentialCodec,
        lookup: Arc<dyn SessionLookup>,
        upstream_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            routes: Arc::new(routes),
            authorizer: Authorizer::new(codec, lookup),
            proxy: Proxy::new(upstream_timeout)?,
            store: None,
            consumer: None,
            internal_token: None,
            start_time: Instant::now(),
        })
    }

    /// State reading sessions from `store` in this process.
    ///
    /// # Errors
    ///
    /// See [`GatewayState::new`].
    pub fn local(
        routes: RouteTable,
        codec: CredentialCodec,
        store: Arc<SessionStore>,
        upstream_timeout: Duration,
    ) -> Result<Self> {
        let lookup = Arc::new(LocalLookup::new(Arc::clone(&store)));
        let mut state = Self::new(routes, codec, lookup, upstream_timeout)?;
        state.store = Some(store);
        Ok(state)
    }

    #[must_use]
    pub fn with_consumer(mut self, consumer: Arc<SessionEventConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    #[must_use]
    pub fn with_internal_token(mut self, token: impl Into<String>) -> Self {
        self.internal_token = Some(token.into());
        self
    }
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("routes", &self.routes.routes().len())
            .field("local_sessions", &self.store.is_some())
            .field("uptime", &self.start_time.elapsed())
            .finish_non_exhaustive()
    }
}

/// Creates the gateway router.
pub fn create_gateway_router(state: GatewayState) -> Router {
    let sessions = match (&state.store, &state.internal_token) {
        (Some(store), Some(token)) => Some(session_router(Arc::clone(store), token)),
        _ => None,
    };

    let mut own = Router::new()
        .route("/health", get(get_health))
        .with_state(state.clone());
    if let Some(sessions) = sessions {
        own = own.merge(sessions);
    }

    Router::new()
        .fallback(proxy_request)
        .with_state(state)
        .nest(GATEWAY_PREFIX, own)
        .layer(TraceLayer::new_for_http())
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayHealthResponse {
    pub status: String,
    pub routes: usize,
    pub session_lookup: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<SessionStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer: Option<ConsumerStats>,
    pub uptime_seconds: u64,
}

async fn get_health(State(state): State<GatewayState>) -> Json<GatewayHealthResponse> {
    Json(GatewayHealthResponse {
        status: "ok".to_string(),
        routes: state.routes.routes().len(),
        session_lookup: if state.store.is_some() { "local" } else { "remote" }.to_string(),
        sessions: state.store.as_ref().map(|s| s.stats()),
        consumer: state.consumer.as_ref().map(|c| c.stats()),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn proxy_request(State(state): State<GatewayState>, request: Request) -> Response {
    let Some(path) = normalize_path(request.uri().path()) else {
        info!(path = %request.uri().path(), "Rejecting unroutable path");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "path cannot be routed", "code": "invalid_path"})),
        )
            .into_response();
    };
    let Some(route) = state.routes.select(&path) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no route for path", "code": "no_route"})),
        )
            .into_response();
    };

    let verdict = state.authorizer.authorize(route, request.headers()).await;
    let identity = match verdict {
        Verdict::Allow { identity } => identity,
        Verdict::Deny(reason) => {
            info!(
                path = %path,
                method = %request.method(),
                reason = reason.code(),
                "Request denied"
            );
            return reason.into_response();
        }
    };

    debug!(
        path = %path,
        route = %route.prefix,
        user_id = identity.as_ref().map_or("-", |i| i.id.as_str()),
        "Request allowed"
    );
    match state.proxy.forward(route, &path, identity.as_ref(), request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}
