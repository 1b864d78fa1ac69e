//! Error types for the AuthBus services.
//!
//! - [`ConfigError`] is shared with the bus crate so both layers report
//!   configuration problems the same way.
//! - [`ServerError`] covers everything that can fail while serving a request
//!   or starting a service.

use std::error::Error;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

pub use authbus_bus::config::ConfigError;

use crate::credential::CredentialError;
use crate::password::PasswordError;

/// Top-level error type for the AuthBus services.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during startup.
    Config(ConfigError),

    /// Bad username/password, or a missing or rejected credential.
    Auth(String),

    /// A request body or parameter failed validation.
    Validation(String),

    /// An upstream service could not be reached through the gateway.
    Upstream(String),

    /// The upstream call exceeded its timeout.
    UpstreamTimeout,

    /// The event bus failed. Never surfaced on the request path by the
    /// services themselves, but kept so startup can report it.
    Bus(authbus_bus::BusError),

    /// Unexpected internal failure.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Auth(msg) => write!(f, "authentication failed: {msg}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::Upstream(msg) => write!(f, "upstream unavailable: {msg}"),
            Self::UpstreamTimeout => write!(f, "upstream timed out"),
            Self::Bus(err) => write!(f, "event bus error: {err}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Bus(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<authbus_bus::BusError> for ServerError {
    fn from(err: authbus_bus::BusError) -> Self {
        Self::Bus(err)
    }
}

impl From<CredentialError> for ServerError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Signing(msg) => Self::Internal(msg),
            other => Self::Auth(other.to_string()),
        }
    }
}

impl From<PasswordError> for ServerError {
    fn from(err: PasswordError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl ServerError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Validation(_))
    }

    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Bus(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code placed in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Auth(_) => "unauthorized",
            Self::Validation(_) => "invalid_request",
            Self::Upstream(_) => "upstream_unavailable",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::Bus(_) => "bus_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal details stay in the log.
        let exposed = !status.is_server_error()
            || matches!(self, Self::Upstream(_) | Self::UpstreamTimeout);
        let message = if exposed {
            self.to_string()
        } else {
            error!(error = %self, "Request failed");
            "internal server error".to_string()
        };

        (status, Json(json!({ "error": message, "code": self.code() }))).into_response()
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
