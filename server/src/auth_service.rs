//! The credential-issuing service.
//!
//! - `POST /api/auth/login` - Check a password, set the `token` cookie, publish `LOGIN`
//! - `POST /api/auth/logout` - Clear the cookie, publish `LOGOUT`
//! - `GET /api/auth/me` - Identity of the presented credential
//! - `GET /health` - Liveness, session and consumer counters
//! - `GET /internal/sessions/{user_id}` - This service's view of a session, mounted
//!   only when an internal token is configured and requiring it as a bearer token
//!
//! A login does not wait for any consumer to apply its `LOGIN`. If the
//! publish itself fails the login still succeeds and the response reports
//! `event_published: false`; other services will deny the credential until
//! a later event reaches them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::consumer::{ConsumerStats, SessionEventConsumer};
use crate::credential::{CredentialCodec, CredentialError, Identity};
use crate::error::{Result, ServerError};
use crate::events::string_or_number;
use crate::gateway::{extract_credential, DenyReason, CREDENTIAL_COOKIE};
use crate::lookup::session_router;
use crate::password::{hash_password, verify_password};
use crate::producer::SessionEventProducer;
use crate::session::{SessionStats, SessionStore};

/// A row of the users file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub username: String,
    pub email: String,
    /// Argon2 PHC string.
    pub password_hash: String,
}

impl UserRecord {
    fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
        }
    }
}

/// Users keyed by username.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    by_username: HashMap<String, UserRecord>,
}

impl UserDirectory {
    pub fn new(users: impl IntoIterator<Item = UserRecord>) -> Self {
        Self {
            by_username: users
                .into_iter()
                .map(|u| (u.username.clone(), u))
                .collect(),
        }
    }

    /// Reads a JSON array of [`UserRecord`]s.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(crate::error::ConfigError::invalid(
                "AUTHBUS_USERS_FILE",
                format!("cannot read {}: {e}", path.display()),
            ))
        })?;
        let users: Vec<UserRecord> = serde_json::from_str(&raw).map_err(|e| {
            ServerError::Config(crate::error::ConfigError::invalid(
                "AUTHBUS_USERS_FILE",
                format!("cannot parse {}: {e}", path.display()),
            ))
        })?;
        Ok(Self::new(users))
    }

    pub fn len(&self) -> usize {
        self.by_username.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_username.is_empty()
    }

    /// Returns the identity for a matching username and password.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Internal`] if the stored hash is malformed.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Option<Identity>> {
        let Some(user) = self.by_username.get(username) else {
            // Same Argon2 cost as a real check, so timing does not reveal
            // which usernames exist.
            if let Some(hash) = dummy_hash() {
                let _ = verify_password(password, hash);
            }
            return Ok(None);
        };
        if verify_password(password, &user.password_hash)? {
            Ok(Some(user.identity()))
        } else {
            Ok(None)
        }
    }
}

fn dummy_hash() -> Option<&'static str> {
    static DUMMY: OnceLock<Option<String>> = OnceLock::new();
    DUMMY
        .get_or_init(|| hash_password("authbus-unknown-user").ok())
        .as_deref()
}

/// Shared auth service state.
#[derive(Clone)]
pub struct AuthState {
    pub users: Arc<UserDirectory>,
    pub codec: CredentialCodec,
    pub producer: SessionEventProducer,
    pub consumer: Arc<SessionEventConsumer>,

    /// Enables `/internal/sessions` for gateways in remote lookup mode.
    pub internal_token: Option<String>,
    pub start_time: Instant,
}

impl AuthState {
    pub fn store(&self) -> Arc<SessionStore> {
        Arc::clone(self.consumer.store())
    }
}

/// Creates the auth service router.
pub fn create_auth_router(state: AuthState) -> Router {
    let sessions = state
        .internal_token
        .as_deref()
        .map(|token| session_router(state.store(), token));

    let mut router = Router::new()
        .route("/api/auth/login", post(post_login))
        .route("/api/auth/logout", post(post_logout))
        .route("/api/auth/me", get(get_me))
        .route("/health", get(get_health))
        .with_state(state);
    if let Some(sessions) = sessions {
        router = router.merge(sessions);
    }
    router.layer(TraceLayer::new_for_http())
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub id: String,
    pub username: String,
    pub email: String,
    /// Whether the `LOGIN` event reached the bus.
    pub event_published: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutResponse {
    pub message: String,
    pub event_published: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthHealthResponse {
    pub status: String,
    pub users: usize,
    pub sessions: SessionStats,
    pub consumer: ConsumerStats,
    pub uptime_seconds: u64,
}

fn session_cookie(token: &str, max_age: Duration) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{CREDENTIAL_COOKIE}={token}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
        max_age.as_secs()
    ))
    .ok()
}

fn cleared_cookie() -> HeaderValue {
    HeaderValue::from_static("token=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0")
}

async fn post_login(
    State(state): State<AuthState>,
    Json(request): Json<LoginRequest>,
) -> Result<Response> {
    let Some(identity) = state
        .users
        .authenticate(&request.username, &request.password)?
    else {
        info!(username = %request.username, "Login rejected");
        return Err(ServerError::auth("invalid credentials"));
    };

    let token = state.codec.issue(&identity)?;
    let lifetime = state
        .codec
        .lifetime()
        .to_std()
        .unwrap_or(Duration::ZERO);
    let cookie = session_cookie(&token, lifetime)
        .ok_or_else(|| ServerError::internal("credential is not a valid cookie value"))?;

    let event_published = state
        .producer
        .login(&identity.id, &identity.username)
        .await
        .is_ok();
    info!(user_id = %identity.id, event_published, "Login succeeded");

    let body = LoginResponse {
        id: identity.id,
        username: identity.username,
        email: identity.email,
        event_published,
    };
    Ok(([(SET_COOKIE, cookie)], Json(body)).into_response())
}

fn authenticated(
    state: &AuthState,
    headers: &HeaderMap,
) -> std::result::Result<Identity, DenyReason> {
    let token = extract_credential(headers).ok_or(DenyReason::NoCredential)?;
    match state.codec.verify(&token) {
        Ok(claims) => Ok(Identity::from(claims)),
        Err(CredentialError::Expired) => Err(DenyReason::ExpiredCredential),
        Err(_) => Err(DenyReason::InvalidCredential),
    }
}

async fn post_logout(State(state): State<AuthState>, headers: HeaderMap) -> Response {
    let identity = match authenticated(&state, &headers) {
        Ok(identity) => identity,
        Err(reason) => return reason.into_response(),
    };

    let event_published = match state.producer.logout(&identity.id, &identity.username).await {
        Ok(_) => true,
        Err(err) => {
            warn!(user_id = %identity.id, error = %err, "Logout event not published");
            false
        }
    };
    info!(user_id = %identity.id, event_published, "Logout");

    (
        [(SET_COOKIE, cleared_cookie())],
        Json(LogoutResponse {
            message: "Logged out successfully".to_string(),
            event_published,
        }),
    )
        .into_response()
}

async fn get_me(State(state): State<AuthState>, headers: HeaderMap) -> Response {
    match authenticated(&state, &headers) {
        Ok(identity) => Json(identity).into_response(),
        Err(reason) => reason.into_response(),
    }
}

async fn get_health(State(state): State<AuthState>) -> (StatusCode, Json<AuthHealthResponse>) {
    let store = state.store();
    (
        StatusCode::OK,
        Json(AuthHealthResponse {
            status: "ok".to_string(),
            users: state.users.len(),
            sessions: store.stats(),
            consumer: state.consumer.stats(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
        }),
    )
}
