//! Error types for the bus client.
//!
//! [`BusError`] is what callers of [`BusClient`](crate::client::BusClient)
//! and [`BusTransport`](crate::client::BusTransport) see. Broker-side
//! failures keep the broker's machine-readable `code` so callers can branch
//! on it without parsing messages.

use std::time::Duration;

use thiserror::Error;

use crate::log::LogError;
use crate::signer::SignerError;

/// Errors raised by bus clients and transports.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker did not answer within the connect timeout.
    #[error("timed out connecting to broker after {0:?}")]
    ConnectTimeout(Duration),

    /// The broker could not be reached.
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    /// An operation needed a connected client.
    #[error("bus client is not connected")]
    NotConnected,

    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The broker answered with an error status.
    #[error("broker returned {status}: {message}")]
    Broker {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// The broker rejected our credentials.
    #[error("broker rejected credentials: {0}")]
    Unauthorized(String),

    /// A record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The in-process log rejected the operation.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Signing the request body failed.
    #[error("signing error: {0}")]
    Signing(#[from] SignerError),
}

impl BusError {
    /// Creates a broker error from a status and optional error body.
    pub fn broker(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        Self::Broker {
            status,
            code,
            message: message.into(),
        }
    }

    /// Returns `true` for failures where retrying later may succeed.
    ///
    /// Used by subscription loops to decide between backing off and
    /// carrying on.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::ConnectTimeout(_) | Self::Connect(_) | Self::NotConnected => true,
            Self::Http(err) => err.is_connect() || err.is_timeout() || err.is_request(),
            Self::Broker { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Broker error code, if the broker supplied one.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Broker { code, .. } => code.as_deref(),
            Self::Log(err) => Some(err.code()),
            _ => None,
        }
    }
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_classification() {
        assert!(BusError::ConnectTimeout(Duration::from_secs(1)).is_connectivity());
        assert!(BusError::Connect("refused".into()).is_connectivity());
        assert!(BusError::NotConnected.is_connectivity());
        assert!(BusError::broker(503, None, "down").is_connectivity());

        assert!(!BusError::broker(400, None, "bad").is_connectivity());
        assert!(!BusError::Unauthorized("nope".into()).is_connectivity());
        assert!(!BusError::Log(LogError::UnknownTopic("t".into())).is_connectivity());
    }

    #[test]
    fn codes_surface_from_broker_and_log() {
        let err = BusError::broker(404, Some("unknown_topic".into()), "unknown topic: t");
        assert_eq!(err.code(), Some("unknown_topic"));
        assert_eq!(err.to_string(), "broker returned 404: unknown topic: t");

        let err = BusError::from(LogError::InvalidTopicName("x y".into()));
        assert_eq!(err.code(), Some("invalid_topic"));
        assert_eq!(BusError::NotConnected.code(), None);
    }
}
