//! Reverse proxy to routed upstreams.
//!
//! Requests are forwarded with their method, headers and body intact apart
//! from hop-by-hop headers, the credential on session routes, and any
//! client-supplied identity headers, which are replaced by the gateway's
//! own. Upstream responses are streamed back.

use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, COOKIE, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::credential::Identity;
use crate::error::{Result, ServerError};
use crate::gateway::CREDENTIAL_COOKIE;
use crate::routing::Route;

/// Largest request body the gateway buffers for forwarding.
pub const MAX_FORWARD_BODY: usize = 10 * 1024 * 1024;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_NAME_HEADER: &str = "x-user-name";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Headers meaningful only for a single connection.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards requests to upstream services.
#[derive(Debug, Clone)]
pub struct Proxy {
    client: reqwest::Client,
    timeout: Duration,
}

impl Proxy {
    /// # Errors
    ///
    /// Returns [`ServerError::Internal`] if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ServerError::internal(format!("failed to build proxy client: {e}")))?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends `request` to `route`'s upstream and returns its response.
    ///
    /// `path` is the normalized request path the route was selected with; it
    /// replaces the raw path of `request`.
    ///
    /// # Errors
    ///
    /// [`ServerError::Validation`] when the body exceeds
    /// [`MAX_FORWARD_BODY`], [`ServerError::UpstreamTimeout`] when the
    /// upstream exceeds the timeout, [`ServerError::Upstream`] when it cannot
    /// be reached.
    pub async fn forward(
        &self,
        route: &Route,
        path: &str,
        identity: Option<&Identity>,
        request: Request,
    ) -> Result<Response> {
        let (parts, body) = request.into_parts();
        let url = route.upstream_url(path, parts.uri.query());

        let body = to_bytes(body, MAX_FORWARD_BODY)
            .await
            .map_err(|e| ServerError::validation(format!("request body rejected: {e}")))?;

        let headers = forward_headers(&parts.headers, identity, route.requires_session);

        debug!(method = %parts.method, upstream = %url, "Forwarding request");
        let upstream = self
            .client
            .request(parts.method.clone(), &url)
            .headers(headers)
            .body(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    warn!(
                        upstream = %url,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Upstream timed out"
                    );
                    ServerError::UpstreamTimeout
                } else {
                    warn!(upstream = %url, error = %err, "Upstream unreachable");
                    ServerError::upstream(err.to_string())
                }
            })?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(out) = response.headers_mut() {
            for (name, value) in upstream.headers() {
                if !is_hop_by_hop(name) {
                    out.append(name.clone(), value.clone());
                }
            }
        }

        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| ServerError::internal(e.to_string()))
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Headers to send upstream.
///
/// Identity headers from the client are always dropped. When
/// `strip_credential` is set the `Authorization` header and the credential
/// cookie are removed as well, leaving the injected identity as the only
/// statement of who is calling. A request id is added when missing.
pub fn forward_headers(
    incoming: &HeaderMap,
    identity: Option<&Identity>,
    strip_credential: bool,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len() + 3);

    for (name, value) in incoming {
        let drop = is_hop_by_hop(name)
            || name == HOST
            || name == CONTENT_LENGTH
            || name == USER_ID_HEADER
            || name == USER_EMAIL_HEADER
            || name == USER_NAME_HEADER
            || (strip_credential && (name == AUTHORIZATION || name == COOKIE));
        if !drop {
            headers.append(name.clone(), value.clone());
        }
    }

    if strip_credential {
        let remaining: Vec<&str> = incoming
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .filter(|c| {
                c.split_once('=')
                    .map_or(true, |(name, _)| name.trim() != CREDENTIAL_COOKIE)
            })
            .collect();
        if !remaining.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&remaining.join("; ")) {
                headers.insert(COOKIE, value);
            }
        }
    }

    if !headers.contains_key(REQUEST_ID_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }
    }

    if let Some(identity) = identity {
        for (name, value) in [
            (USER_ID_HEADER, &identity.id),
            (USER_EMAIL_HEADER, &identity.email),
            (USER_NAME_HEADER, &identity.username),
        ] {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
    }

    headers
}
