//! AuthBus services - the gateway and the auth service.
//!
//! This crate provides:
//! - The auth service, which checks passwords, issues credentials and
//!   publishes login/logout events to the bus
//! - The gateway, which validates credentials, checks the user's session
//!   state and proxies allowed requests to upstream services
//! - The session store and consumer every service uses to track sessions
//!
//! # Architecture
//!
//! Session state is derived only from `session-events` records. Each service
//! that needs it runs its own consumer group, so every replica group sees
//! every event. A logout published by the auth service revokes access at
//! the gateway once the gateway's consumer applies it, even though the
//! credential itself is still within its lifetime.

pub mod attach;
pub mod auth_service;
pub mod config;
pub mod consumer;
pub mod credential;
pub mod error;
pub mod events;
pub mod gateway;
pub mod lookup;
pub mod password;
pub mod producer;
pub mod proxy;
pub mod routes;
pub mod routing;
pub mod session;

pub use credential::{CredentialCodec, Identity};
pub use error::ServerError;
pub use gateway::{Authorizer, DenyReason, Verdict};
pub use session::{SessionState, SessionStore};
