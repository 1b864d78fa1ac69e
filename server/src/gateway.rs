//! Per-request authorization.
//!
//! The gateway checks a request in two stages. The credential check is
//! local and stateless (signature and expiry). The session check then asks
//! the session store whether the credential's user is still logged in,
//! which is what lets a logout seen on the bus revoke a credential that is
//! still structurally valid.
//!
//! Until a gateway's store has seen a user's `LOGIN`, requests from that
//! user are denied with [`DenyReason::SessionNotYetSeen`], kept distinct
//! from [`DenyReason::SessionNotActive`] so the two show up separately in
//! logs and responses.

use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;
use tracing::{debug, warn};

use crate::credential::{CredentialCodec, CredentialError, Identity};
use crate::lookup::SessionLookup;
use crate::routing::Route;
use crate::session::SessionState;

/// Name of the cookie carrying the credential.
pub const CREDENTIAL_COOKIE: &str = "token";

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NoCredential,
    InvalidCredential,
    ExpiredCredential,
    /// The user logged out.
    SessionNotActive,
    /// No session event for this user has reached this store yet.
    SessionNotYetSeen,
    SessionLookupUnavailable,
}

impl DenyReason {
    pub fn status(self) -> StatusCode {
        match self {
            Self::SessionLookupUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Machine-readable reason code.
    pub fn code(self) -> &'static str {
        match self {
            Self::NoCredential => "no_credential",
            Self::InvalidCredential | Self::ExpiredCredential => "invalid_credential",
            Self::SessionNotActive => "session_not_active",
            Self::SessionNotYetSeen => "session_not_yet_seen",
            Self::SessionLookupUnavailable => "session_lookup_unavailable",
        }
    }

    pub fn detail(self) -> Option<&'static str> {
        match self {
            Self::ExpiredCredential => Some("expired"),
            _ => None,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::NoCredential => "No token provided",
            Self::InvalidCredential => "Invalid token",
            Self::ExpiredCredential => "Token expired",
            Self::SessionNotActive => "Session is no longer active",
            Self::SessionNotYetSeen => "Session not yet known to this service, retry shortly",
            Self::SessionLookupUnavailable => "Session state unavailable",
        }
    }
}

#[derive(Serialize)]
struct DenyBody {
    error: &'static str,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'static str>,
}

impl IntoResponse for DenyReason {
    fn into_response(self) -> Response {
        let body = DenyBody {
            error: self.message(),
            code: self.code(),
            detail: self.detail(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Outcome of [`Authorizer::authorize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Forward the request. `identity` is set when a valid credential was
    /// attached.
    Allow { identity: Option<Identity> },
    Deny(DenyReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Pulls the credential from the `token` cookie, else from
/// `Authorization: Bearer`.
pub fn extract_credential(headers: &HeaderMap) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    if let Some(cookie) = jar.get(CREDENTIAL_COOKIE) {
        if !cookie.value().is_empty() {
            return Some(cookie.value().to_string());
        }
    }

    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = header.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// Decides whether a request may be forwarded.
#[derive(Clone)]
pub struct Authorizer {
    codec: CredentialCodec,
    lookup: Arc<dyn SessionLookup>,
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizer")
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl Authorizer {
    pub fn new(codec: CredentialCodec, lookup: Arc<dyn SessionLookup>) -> Self {
        Self { codec, lookup }
    }

    pub fn codec(&self) -> &CredentialCodec {
        &self.codec
    }

    /// Authorizes a request that matched `route`.
    ///
    /// Open routes are always allowed; a valid credential only adds an
    /// identity. Session routes need a valid credential whose user is
    /// active in the session store.
    pub async fn authorize(&self, route: &Route, headers: &HeaderMap) -> Verdict {
        let credential = extract_credential(headers);

        if !route.requires_session {
            let identity = credential
                .and_then(|token| self.codec.verify(&token).ok())
                .map(Identity::from);
            return Verdict::Allow { identity };
        }

        let Some(token) = credential else {
            return Verdict::Deny(DenyReason::NoCredential);
        };

        let identity = match self.codec.verify(&token) {
            Ok(claims) => Identity::from(claims),
            Err(CredentialError::Expired) => {
                return Verdict::Deny(DenyReason::ExpiredCredential)
            }
            Err(err) => {
                debug!(error = %err, "Rejected credential");
                return Verdict::Deny(DenyReason::InvalidCredential);
            }
        };

        match self.lookup.state(&identity.id).await {
            Ok(SessionState::Active) => Verdict::Allow {
                identity: Some(identity),
            },
            Ok(SessionState::Inactive) => Verdict::Deny(DenyReason::SessionNotActive),
            Ok(SessionState::Unknown) => Verdict::Deny(DenyReason::SessionNotYetSeen),
            Err(err) => {
                warn!(user_id = %identity.id, error = %err, "Session lookup failed");
                Verdict::Deny(DenyReason::SessionLookupUnavailable)
            }
        }
    }
}
