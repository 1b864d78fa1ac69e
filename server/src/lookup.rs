//! Where the gateway reads session state from.
//!
//! A gateway either owns a [`SessionStore`] fed by its own consumer
//! ([`LocalLookup`]) or asks a service that does ([`RemoteLookup`]).
//!
//! The `/internal/sessions/{user_id}` endpoint exposes usernames and login
//! times, so it requires `Authorization: Bearer <AUTHBUS_INTERNAL_TOKEN>`,
//! compared in constant time. Services without a configured token do not
//! mount it at all.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use authbus_bus::auth::bearer_token;

use crate::session::{SessionRecord, SessionState, SessionStore};

const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// The session owner could not be reached or answered nonsense.
    #[error("session lookup unavailable: {0}")]
    Unavailable(String),
}

/// Body of `GET /internal/sessions/{user_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub user_id: String,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionRecord>,
}

impl SessionView {
    pub fn from_store(store: &SessionStore, user_id: &str) -> Self {
        let session = store.get(user_id);
        Self {
            user_id: user_id.to_string(),
            state: session.as_ref().map_or(SessionState::Unknown, SessionRecord::state),
            session,
        }
    }
}

#[derive(Clone)]
struct SessionEndpoint {
    store: Arc<SessionStore>,
    token: Arc<str>,
}

/// Serves `GET /internal/sessions/{user_id}` from `store` to callers
/// presenting `token`.
///
/// Mounted by every service that owns a store, so gateways in remote mode
/// can point at any of them.
pub fn session_router(store: Arc<SessionStore>, token: &str) -> Router {
    Router::new()
        .route("/internal/sessions/{user_id}", get(get_session))
        .with_state(SessionEndpoint {
            store,
            token: Arc::from(token),
        })
}

/// Constant-time check of an `Authorization: Bearer` header against `expected`.
fn has_internal_token(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .is_some_and(|presented| bool::from(presented.as_bytes().ct_eq(expected.as_bytes())))
}

async fn get_session(
    State(endpoint): State<SessionEndpoint>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !has_internal_token(&headers, &endpoint.token) {
        debug!("Session lookup without a valid internal token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "internal token required", "code": "unauthorized"})),
        )
            .into_response();
    }
    Json(SessionView::from_store(&endpoint.store, &user_id)).into_response()
}

#[async_trait]
pub trait SessionLookup: Send + Sync + 'static {
    async fn state(&self, user_id: &str) -> Result<SessionState, LookupError>;
}

/// Reads this process's store.
#[derive(Debug, Clone)]
pub struct LocalLookup {
    store: Arc<SessionStore>,
}

impl LocalLookup {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SessionLookup for LocalLookup {
    async fn state(&self, user_id: &str) -> Result<SessionState, LookupError> {
        Ok(self.store.state(user_id))
    }
}

/// Asks another service's `/internal/sessions` endpoint.
#[derive(Clone)]
pub struct RemoteLookup {
    client: Client,
    base_url: Url,
    token: String,
}

impl std::fmt::Debug for RemoteLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteLookup")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl RemoteLookup {
    /// Lookup against `base_url`, authenticating with the internal `token`.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::Unavailable`] if `base_url` does not parse or
    /// the HTTP client cannot be built.
    pub fn new(base_url: &str, token: &str) -> Result<Self, LookupError> {
        Self::with_timeout(base_url, token, DEFAULT_LOOKUP_TIMEOUT)
    }

    /// # Errors
    ///
    /// See [`RemoteLookup::new`].
    pub fn with_timeout(
        base_url: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, LookupError> {
        let base_url =
            Url::parse(base_url).map_err(|e| LookupError::Unavailable(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(LookupError::Unavailable(format!(
                "'{base_url}' cannot be used as a base URL"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LookupError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
        })
    }

    fn url_for(&self, user_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["internal", "sessions", user_id]);
        }
        url
    }
}

#[async_trait]
impl SessionLookup for RemoteLookup {
    async fn state(&self, user_id: &str) -> Result<SessionState, LookupError> {
        let response = self
            .client
            .get(self.url_for(user_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| LookupError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LookupError::Unavailable(format!(
                "session owner returned {}",
                response.status()
            )));
        }

        let view: SessionView = response
            .json()
            .await
            .map_err(|e| LookupError::Unavailable(e.to_string()))?;
        Ok(view.state)
    }
}
