//! Service configuration.
//!
//! Parses configuration from environment variables for the gateway and the
//! auth service.
//!
//! # Environment Variables
//!
//! Shared:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `AUTHBUS_JWT_SECRET` | Yes | - | HMAC secret shared by every service that validates credentials |
//! | `AUTHBUS_SERVICE_NAME` | No | per binary | Consumer group is `<name>-group` |
//! | `AUTHBUS_SESSION_RETENTION_SECS` | No | unset | Evict inactive sessions after this long |
//! | `AUTHBUS_INTERNAL_TOKEN` | No | unset | Bearer token for `/internal/sessions`; the endpoint is not served without it |
//! | `AUTHBUS_BROKER_URL` etc. | No | see bus crate | Event bus connection |
//!
//! Gateway:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORT` | No | 4000 | HTTP port |
//! | `AUTHBUS_ROUTES` | No | built-in table | `prefix=>target[=>rewrite][;session]`, comma-separated |
//! | `AUTHBUS_SESSION_LOOKUP_URL` | No | unset | Ask this service for session state instead of consuming events locally; needs `AUTHBUS_INTERNAL_TOKEN` |
//! | `AUTHBUS_UPSTREAM_TIMEOUT_MS` | No | 30000 | Per-request upstream timeout |
//!
//! Auth service:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORT` | No | 3001 | HTTP port |
//! | `AUTHBUS_USERS_FILE` | Yes | - | JSON array of `{id, username, email, password_hash}` |
//! | `AUTHBUS_CREDENTIAL_LIFETIME_SECS` | No | 86400 | Credential and cookie lifetime |

use std::path::PathBuf;
use std::time::Duration;

use authbus_bus::config::{non_empty_env, parse_env_or, parse_port, ClientConfig};

use crate::credential::DEFAULT_CREDENTIAL_LIFETIME_SECS;
use crate::error::ConfigError;
use crate::routing::RouteTable;

const DEFAULT_GATEWAY_PORT: u16 = 4000;
const DEFAULT_AUTH_PORT: u16 = 3001;
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 30_000;

/// Settings every service shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Names the consumer group, so replicas of one service share offsets.
    pub service_name: String,

    /// HMAC secret for credentials.
    pub jwt_secret: String,

    /// Inactive sessions older than this are evicted. `None` keeps them.
    pub session_retention: Option<Duration>,

    /// Guards `/internal/sessions` and is sent by remote lookups.
    pub internal_token: Option<String>,

    pub bus: ClientConfig,
}

impl ServiceConfig {
    /// # Errors
    ///
    /// Returns `ConfigError` if the JWT secret is missing or a variable is
    /// malformed.
    pub fn from_env(default_service_name: &str) -> Result<Self, ConfigError> {
        let jwt_secret = non_empty_env("AUTHBUS_JWT_SECRET")
            .ok_or_else(|| ConfigError::MissingEnvVar("AUTHBUS_JWT_SECRET".to_string()))?;

        let retention_secs: u64 = parse_env_or("AUTHBUS_SESSION_RETENTION_SECS", 0)?;

        Ok(Self {
            service_name: non_empty_env("AUTHBUS_SERVICE_NAME")
                .unwrap_or_else(|| default_service_name.to_string()),
            jwt_secret,
            session_retention: (retention_secs > 0).then(|| Duration::from_secs(retention_secs)),
            internal_token: non_empty_env("AUTHBUS_INTERNAL_TOKEN"),
            bus: ClientConfig::from_env()?,
        })
    }

    /// `<service>-group`.
    pub fn consumer_group(&self) -> String {
        format!("{}-group", self.service_name)
    }
}

/// Where the gateway reads session state from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookupMode {
    /// A store in this process, fed by this process's own consumer.
    Local,

    /// `GET {base}/internal/sessions/{user_id}` on a service that owns a store.
    Remote(String),
}

/// Gateway configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub routes: RouteTable,
    pub session_lookup: SessionLookupMode,
    pub upstream_timeout: Duration,
    pub service: ServiceConfig,
}

impl GatewayConfig {
    /// Parse gateway configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a missing secret, a malformed route table,
    /// a non-http(s) lookup URL, or a lookup URL without an internal token.
    pub fn from_env() -> Result<Self, ConfigError> {
        let routes = match non_empty_env("AUTHBUS_ROUTES") {
            Some(raw) => RouteTable::parse(&raw)?,
            None => RouteTable::default(),
        };

        let session_lookup = match non_empty_env("AUTHBUS_SESSION_LOOKUP_URL") {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                SessionLookupMode::Remote(url.trim_end_matches('/').to_string())
            }
            Some(_) => {
                return Err(ConfigError::invalid(
                    "AUTHBUS_SESSION_LOOKUP_URL",
                    "must start with http:// or https://",
                ))
            }
            None => SessionLookupMode::Local,
        };

        let upstream_timeout_ms =
            parse_env_or("AUTHBUS_UPSTREAM_TIMEOUT_MS", DEFAULT_UPSTREAM_TIMEOUT_MS)?;
        if upstream_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "AUTHBUS_UPSTREAM_TIMEOUT_MS",
                "must be greater than zero",
            ));
        }

        let service = ServiceConfig::from_env("gateway")?;
        if matches!(session_lookup, SessionLookupMode::Remote(_)) && service.internal_token.is_none()
        {
            return Err(ConfigError::MissingEnvVar(
                "AUTHBUS_INTERNAL_TOKEN".to_string(),
            ));
        }

        Ok(Self {
            port: parse_port(DEFAULT_GATEWAY_PORT)?,
            routes,
            session_lookup,
            upstream_timeout: Duration::from_millis(upstream_timeout_ms),
            service,
        })
    }
}

/// Auth service configuration parsed from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthServiceConfig {
    pub port: u16,
    pub users_file: PathBuf,
    pub credential_lifetime: Duration,
    pub service: ServiceConfig,
}

impl AuthServiceConfig {
    /// Parse auth service configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the secret or users file is missing, or the
    /// lifetime is zero or malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let users_file = non_empty_env("AUTHBUS_USERS_FILE")
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("AUTHBUS_USERS_FILE".to_string()))?;

        let lifetime_secs: i64 =
            parse_env_or("AUTHBUS_CREDENTIAL_LIFETIME_SECS", DEFAULT_CREDENTIAL_LIFETIME_SECS)?;
        let lifetime_secs = u64::try_from(lifetime_secs)
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| {
                ConfigError::invalid("AUTHBUS_CREDENTIAL_LIFETIME_SECS", "must be positive")
            })?;

        Ok(Self {
            port: parse_port(DEFAULT_AUTH_PORT)?,
            users_file,
            credential_lifetime: Duration::from_secs(lifetime_secs),
            service: ServiceConfig::from_env("auth-service")?,
        })
    }
}
