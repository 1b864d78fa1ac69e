//! Broker and client configuration.
//!
//! Parses configuration from environment variables.
//!
//! # Broker Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `AUTHBUS_PRODUCER_KEYS` | Yes* | - | Format: `source1:pubkey1,source2:pubkey2` |
//! | `AUTHBUS_CONSUMER_TOKEN` | Yes* | - | Bearer token for fetch/offset/commit calls |
//! | `PORT` | No | 9400 | HTTP server port |
//! | `AUTHBUS_PARTITIONS` | No | 3 | Partitions per auto-created topic |
//! | `AUTHBUS_TOPICS` | No | the four service topics | Topics created at startup |
//! | `AUTHBUS_MAX_WAIT_MS` | No | 30000 | Cap on long-poll fetch waits |
//! | `AUTHBUS_UNSAFE_NO_AUTH` | No | false | Disable all authentication (dev only) |
//!
//! *Not required if `AUTHBUS_UNSAFE_NO_AUTH=true`
//!
//! # Client Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `AUTHBUS_BROKER_URL` | `http://127.0.0.1:9400` | Broker base URL |
//! | `AUTHBUS_CONSUMER_TOKEN` | - | Sent as a bearer token by consumers |
//! | `AUTHBUS_SOURCE_ID` | `<hostname>-<pid>` | Producer identity (`X-Source-ID`) |
//! | `AUTHBUS_CONNECT_TIMEOUT_MS` | 5000 | Bound on `connect()` |
//! | `AUTHBUS_REQUEST_TIMEOUT_MS` | 10000 | Per-request timeout, added to any long-poll wait |

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::auth::ProducerKeys;
use crate::log::{DEFAULT_PARTITIONS, MAX_PARTITIONS};
use crate::types::is_valid_topic_name;

/// Default broker port.
const DEFAULT_BROKER_PORT: u16 = 9400;

/// Default cap on long-poll waits, in milliseconds.
const DEFAULT_MAX_WAIT_MS: u64 = 30_000;

/// Default broker URL used by clients.
pub const DEFAULT_BROKER_URL: &str = "http://127.0.0.1:9400";

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Topics every deployment uses.
pub const DEFAULT_TOPICS: [&str; 4] = [
    "session-events",
    "todo-events",
    "category-events",
    "user-events",
];

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

impl ConfigError {
    pub fn invalid(var: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            var: var.into(),
            message: message.into(),
        }
    }
}

/// Broker configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Map of source id to base64-encoded Ed25519 public key.
    pub producer_keys: HashMap<String, String>,

    /// Bearer token consumers must present.
    pub consumer_token: Option<String>,

    /// HTTP server port.
    pub port: u16,

    /// Partitions given to topics created without an explicit count.
    pub default_partitions: u32,

    /// Topics created at startup.
    pub topics: Vec<String>,

    /// Upper bound on how long a fetch may be held open.
    pub max_wait: Duration,

    /// When true, disables all authentication (development only).
    pub unsafe_no_auth: bool,
}

impl BrokerConfig {
    /// Parse broker configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is malformed, or if authentication
    /// material is missing while `AUTHBUS_UNSAFE_NO_AUTH` is not true.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            producer_keys: parse_pairs_env("AUTHBUS_PRODUCER_KEYS", ':')?,
            consumer_token: non_empty_env("AUTHBUS_CONSUMER_TOKEN"),
            port: parse_port(DEFAULT_BROKER_PORT)?,
            default_partitions: parse_env_or("AUTHBUS_PARTITIONS", DEFAULT_PARTITIONS)?,
            topics: parse_list_env("AUTHBUS_TOPICS")
                .unwrap_or_else(|| DEFAULT_TOPICS.iter().map(ToString::to_string).collect()),
            max_wait: Duration::from_millis(parse_env_or(
                "AUTHBUS_MAX_WAIT_MS",
                DEFAULT_MAX_WAIT_MS,
            )?),
            unsafe_no_auth: parse_bool_env("AUTHBUS_UNSAFE_NO_AUTH"),
        };

        config.validate()?;

        if config.unsafe_no_auth {
            warn!(
                "AUTHBUS_UNSAFE_NO_AUTH is enabled - broker authentication is disabled. \
                 Do not use in production!"
            );
        }

        Ok(config)
    }

    /// Decoded producer key registry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidFormat`] if any key fails to decode.
    pub fn producer_key_registry(&self) -> Result<ProducerKeys, ConfigError> {
        ProducerKeys::from_base64_map(&self.producer_keys)
            .map_err(|e| ConfigError::invalid("AUTHBUS_PRODUCER_KEYS", e.to_string()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_partitions == 0 || self.default_partitions > MAX_PARTITIONS {
            return Err(ConfigError::invalid(
                "AUTHBUS_PARTITIONS",
                format!("must be between 1 and {MAX_PARTITIONS}"),
            ));
        }

        if let Some(bad) = self.topics.iter().find(|t| !is_valid_topic_name(t)) {
            return Err(ConfigError::invalid(
                "AUTHBUS_TOPICS",
                format!("invalid topic name '{bad}'"),
            ));
        }

        // Malformed keys are rejected even in unsafe mode.
        self.producer_key_registry()?;

        if self.unsafe_no_auth {
            return Ok(());
        }

        if self.producer_keys.is_empty() {
            return Err(ConfigError::MissingEnvVar(
                "AUTHBUS_PRODUCER_KEYS".to_string(),
            ));
        }

        if self.consumer_token.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "AUTHBUS_CONSUMER_TOKEN".to_string(),
            ));
        }

        Ok(())
    }
}

/// Client-side connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub broker_url: String,
    pub consumer_token: Option<String>,
    pub source_id: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Settings for a broker at `broker_url` with default timeouts.
    #[must_use]
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            consumer_token: None,
            source_id: default_source_id(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }

    /// Parse client configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a timeout is not a number or the broker URL
    /// is not http(s).
    pub fn from_env() -> Result<Self, ConfigError> {
        let broker_url = non_empty_env("AUTHBUS_BROKER_URL")
            .unwrap_or_else(|| DEFAULT_BROKER_URL.to_string());
        if !broker_url.starts_with("http://") && !broker_url.starts_with("https://") {
            return Err(ConfigError::invalid(
                "AUTHBUS_BROKER_URL",
                "must start with http:// or https://",
            ));
        }

        Ok(Self {
            broker_url: broker_url.trim_end_matches('/').to_string(),
            consumer_token: non_empty_env("AUTHBUS_CONSUMER_TOKEN"),
            source_id: non_empty_env("AUTHBUS_SOURCE_ID").unwrap_or_else(default_source_id),
            connect_timeout: Duration::from_millis(parse_env_or(
                "AUTHBUS_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )?),
            request_timeout: Duration::from_millis(parse_env_or(
                "AUTHBUS_REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            )?),
        })
    }
}

/// `<hostname>-<pid>`, used when no explicit source id is configured.
#[must_use]
pub fn default_source_id() -> String {
    let host = gethostname::gethostname();
    format!("{}-{}", host.to_string_lossy(), std::process::id())
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
#[must_use]
pub fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Reads an environment variable, treating blank values as unset.
#[must_use]
pub fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse the PORT environment variable, falling back to `default`.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidFormat`] if PORT is not a valid u16.
pub fn parse_port(default: u16) -> Result<u16, ConfigError> {
    parse_env_or("PORT", default)
}

/// Parse a numeric (or any `FromStr`) variable, falling back to `default`.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidFormat`] when the value does not parse.
pub fn parse_env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(name, e.to_string())),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => {
            Err(ConfigError::invalid(name, "contains invalid unicode"))
        }
    }
}

/// Parse a comma-separated list variable. Returns `None` when unset or blank.
#[must_use]
pub fn parse_list_env(name: &str) -> Option<Vec<String>> {
    let raw = non_empty_env(name)?;
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}

/// Parse a `name<sep>value,name<sep>value` variable into a map.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidFormat`] for entries without the separator
/// or with an empty name or value.
pub fn parse_pairs_env(name: &str, separator: char) -> Result<HashMap<String, String>, ConfigError> {
    match non_empty_env(name) {
        Some(raw) => parse_pairs(name, &raw, separator),
        None => Ok(HashMap::new()),
    }
}

/// Parse a `name<sep>value,...` string. `var` names the source in errors.
///
/// # Errors
///
/// See [`parse_pairs_env`].
pub fn parse_pairs(
    var: &str,
    raw: &str,
    separator: char,
) -> Result<HashMap<String, String>, ConfigError> {
    let mut pairs = HashMap::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, value) = entry.split_once(separator).ok_or_else(|| {
            ConfigError::invalid(
                var,
                format!("expected 'name{separator}value' format, got '{entry}'"),
            )
        })?;
        let (name, value) = (name.trim(), value.trim());

        if name.is_empty() {
            return Err(ConfigError::invalid(var, "name cannot be empty"));
        }
        if value.is_empty() {
            return Err(ConfigError::invalid(
                var,
                format!("value for '{name}' cannot be empty"),
            ));
        }

        pairs.insert(name.to_string(), value.to_string());
    }

    Ok(pairs)
}
