//! AuthBus event bus.
//!
//! A small partitioned, append-only log with consumer groups, served over
//! HTTP by the `authbus-broker` binary, plus the client services use to
//! publish and subscribe.
//!
//! # Architecture
//!
//! Producers sign each publish with an Ed25519 key. Records with the same key
//! land on the same partition and keep their order. Consumer groups commit
//! positions after handling each batch, giving at-least-once delivery.

pub mod auth;
pub mod broadcast;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod log;
pub mod runtime;
pub mod signer;
pub mod subscription;
pub mod types;

pub use client::{BusClient, BusTransport, HttpTransport, LocalTransport};
pub use error::BusError;
pub use subscription::{Backoff, HandlerError, RecordHandler, SubscribeOptions};
pub use types::{Record, RecordMetadata};
