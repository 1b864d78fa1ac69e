//! End-to-end tests of the broker over real HTTP.
//!
//! A broker is bound to an ephemeral port with authentication enabled, and
//! [`BusClient`]s talk to it through [`HttpTransport`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use authbus_bus::broker::{create_router, AppState};
use authbus_bus::config::{BrokerConfig, ClientConfig};
use authbus_bus::signer::ProducerSigner;
use authbus_bus::{BusClient, BusError, HandlerError, Record, RecordHandler, SubscribeOptions};

const CONSUMER_TOKEN: &str = "integration-token";
const SEED: [u8; 32] = [11u8; 32];

fn signer() -> ProducerSigner {
    use base64::prelude::*;
    ProducerSigner::from_base64(&BASE64_STANDARD.encode(SEED)).unwrap()
}

async fn spawn_broker() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let config = BrokerConfig {
        producer_keys: HashMap::from([(
            "auth-service".to_string(),
            signer().public_key_base64(),
        )]),
        consumer_token: Some(CONSUMER_TOKEN.to_string()),
        port: 0,
        default_partitions: 3,
        topics: vec!["session-events".to_string()],
        max_wait: Duration::from_secs(1),
        unsafe_no_auth: false,
    };
    let app = create_router(AppState::new(config).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    (addr, handle)
}

fn client_config(addr: SocketAddr, token: &str) -> ClientConfig {
    let mut config = ClientConfig::new(format!("http://{addr}"));
    config.consumer_token = Some(token.to_string());
    config.source_id = "auth-service".to_string();
    config
}

async fn connected_client(addr: SocketAddr, signed: bool) -> BusClient {
    let client = BusClient::http(
        client_config(addr, CONSUMER_TOKEN),
        signed.then(signer),
    )
    .unwrap();
    client.connect().await.unwrap();
    client
}

fn options(group: &str) -> SubscribeOptions {
    SubscribeOptions::new(group, ["session-events"])
        .with_fetch_wait(Duration::from_millis(200))
        .with_retry_delay(Duration::from_millis(20))
}

struct Forward(mpsc::UnboundedSender<Record>);

#[async_trait]
impl RecordHandler for Forward {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        let _ = self.0.send(record.clone());
        Ok(())
    }
}

#[tokio::test]
async fn published_records_reach_subscriber_in_key_order() {
    let (addr, server) = spawn_broker().await;
    let client = connected_client(addr, true).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscribe(options("gateway-group"), Arc::new(Forward(tx)))
        .await
        .unwrap();

    for kind in ["LOGIN", "LOGOUT", "LOGIN"] {
        client
            .publish("session-events", Some("42"), &json!({"type": kind, "userId": "42"}))
            .await
            .unwrap();
    }

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let record = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("record not delivered in time")
            .unwrap();
        assert_eq!(record.key.as_deref(), Some("42"));
        kinds.push(record.value["type"].as_str().unwrap().to_string());
    }
    assert_eq!(kinds, vec!["LOGIN", "LOGOUT", "LOGIN"]);

    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn unsigned_publish_is_rejected() {
    let (addr, server) = spawn_broker().await;
    let client = connected_client(addr, false).await;

    let err = client
        .publish("session-events", None, &json!({"type": "LOGIN"}))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Unauthorized(_)), "got {err:?}");

    server.abort();
}

#[tokio::test]
async fn subscribe_with_wrong_token_fails() {
    let (addr, server) = spawn_broker().await;
    let client = BusClient::http(client_config(addr, "wrong"), None).unwrap();
    client.connect().await.unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = client
        .subscribe(options("g"), Arc::new(Forward(tx)))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Unauthorized(_)), "got {err:?}");
    assert_eq!(client.subscription_count().await, 0);

    server.abort();
}

#[tokio::test]
async fn connect_to_missing_broker_fails_without_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = BusClient::http(client_config(addr, CONSUMER_TOKEN), None).unwrap();
    let err = client.connect().await.unwrap_err();
    assert!(err.is_connectivity(), "got {err:?}");

    client.disconnect().await;
    client.disconnect().await;
}

/// Counts deliveries per value and stalls forever on `stall_on`.
struct Stalling {
    seen: Arc<Mutex<Vec<Value>>>,
    stall_on: Option<Value>,
    reached: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl RecordHandler for Stalling {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(record.value.clone());
        let _ = self.reached.send(());
        if self.stall_on.as_ref() == Some(&record.value) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn crash_before_commit_redelivers_batch() {
    let (addr, server) = spawn_broker().await;
    let producer = connected_client(addr, true).await;
    producer
        .publish("session-events", Some("7"), &json!("r1"))
        .await
        .unwrap();
    producer
        .publish("session-events", Some("7"), &json!("r2"))
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));

    // First consumer handles r1, then hangs on r2 and is killed.
    let (reached_tx, mut reached_rx) = mpsc::unbounded_channel();
    let first = connected_client(addr, false).await;
    first
        .subscribe(
            options("replay-group").from_beginning(true),
            Arc::new(Stalling {
                seen: Arc::clone(&seen),
                stall_on: Some(json!("r2")),
                reached: reached_tx,
            }),
        )
        .await
        .unwrap();
    for _ in 0..2 {
        timeout(Duration::from_secs(5), reached_rx.recv())
            .await
            .unwrap()
            .unwrap();
    }
    drop(first);

    // Second consumer in the same group starts from the last commit.
    let (reached_tx, mut reached_rx) = mpsc::unbounded_channel();
    let second = connected_client(addr, false).await;
    second
        .subscribe(
            options("replay-group").from_beginning(true),
            Arc::new(Stalling {
                seen: Arc::clone(&seen),
                stall_on: None,
                reached: reached_tx,
            }),
        )
        .await
        .unwrap();
    for _ in 0..2 {
        timeout(Duration::from_secs(5), reached_rx.recv())
            .await
            .unwrap()
            .unwrap();
    }
    second.disconnect().await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![json!("r1"), json!("r2"), json!("r1"), json!("r2")]);

    server.abort();
}
