//! Event bus client.
//!
//! [`BusClient`] is what services use: connect, publish structured records,
//! subscribe a consumer group, disconnect. It talks to the log through a
//! [`BusTransport`]:
//!
//! - [`LocalTransport`] shares an in-process [`PartitionedLog`], for tests
//!   and single-process deployments.
//! - [`HttpTransport`] speaks to an `authbus-broker` over HTTP, signing
//!   publish bodies with the producer's Ed25519 key when one is configured.
//!
//! The client never retries a publish. Callers decide whether a failed
//! publish matters.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use authbus_bus::client::{BusClient, LocalTransport};
//! use authbus_bus::log::PartitionedLog;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let log = Arc::new(PartitionedLog::default());
//! let client = BusClient::new(Arc::new(LocalTransport::new(log)));
//!
//! client.connect().await.unwrap();
//! let meta = client
//!     .publish("session-events", Some("1"), &json!({"type": "LOGIN"}))
//!     .await
//!     .unwrap();
//! assert_eq!(meta.offset, 0);
//! client.disconnect().await;
//! # });
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{default_source_id, ClientConfig};
use crate::error::{BusError, Result};
use crate::log::PartitionedLog;
use crate::signer::ProducerSigner;
use crate::subscription::{RecordHandler, SubscribeOptions, Subscription};
use crate::types::{
    CommitRequest, CreateTopicsRequest, ErrorBody, FetchRequest, FetchResponse, GroupOffset,
    OffsetsResponse, PartitionOffset, PublishRequest, Record, RecordMetadata,
};

/// Default bound on [`BusClient::connect`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Header carrying the producer identity.
pub const SOURCE_ID_HEADER: &str = "X-Source-ID";

/// Header carrying the base64 Ed25519 body signature.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Operations a bus backend must provide.
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<()>;

    /// Creates topics that do not exist yet.
    async fn create_topics(&self, topics: &[String]) -> Result<()>;

    /// Appends one record.
    async fn append(&self, topic: &str, key: Option<String>, value: Value)
        -> Result<RecordMetadata>;

    /// Reads records, waiting up to `request.wait_ms` when none are ready.
    async fn fetch(&self, request: FetchRequest) -> Result<Vec<Record>>;

    /// Committed and end offsets of `group` for every partition of `topics`.
    async fn offsets(&self, group: &str, topics: &[String]) -> Result<Vec<GroupOffset>>;

    /// Stores the next read positions of `group`.
    async fn commit(&self, group: &str, offsets: &[PartitionOffset]) -> Result<()>;
}

/// Transport over a log in this process.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    log: Arc<PartitionedLog>,
}

impl LocalTransport {
    #[must_use]
    pub fn new(log: Arc<PartitionedLog>) -> Self {
        Self { log }
    }

    #[must_use]
    pub fn log(&self) -> &Arc<PartitionedLog> {
        &self.log
    }
}

#[async_trait]
impl BusTransport for LocalTransport {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_topics(&self, topics: &[String]) -> Result<()> {
        for topic in topics {
            self.log.create_topic(topic, None)?;
        }
        Ok(())
    }

    async fn append(
        &self,
        topic: &str,
        key: Option<String>,
        value: Value,
    ) -> Result<RecordMetadata> {
        Ok(self.log.append(topic, key, value)?)
    }

    async fn fetch(&self, request: FetchRequest) -> Result<Vec<Record>> {
        Ok(self
            .log
            .poll(
                &request.positions,
                request.max_records,
                Duration::from_millis(request.wait_ms),
            )
            .await)
    }

    async fn offsets(&self, group: &str, topics: &[String]) -> Result<Vec<GroupOffset>> {
        let mut offsets = Vec::new();
        for topic in topics {
            offsets.extend(self.log.group_offsets(group, topic)?);
        }
        Ok(offsets)
    }

    async fn commit(&self, group: &str, offsets: &[PartitionOffset]) -> Result<()> {
        for position in offsets {
            self.log
                .commit(group, &position.topic, position.partition, position.offset)?;
        }
        Ok(())
    }
}

/// Transport over the broker's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    config: ClientConfig,
    signer: Option<Arc<ProducerSigner>>,
}

impl HttpTransport {
    /// Creates a transport for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Http`] if the HTTP client cannot be built.
    pub fn new(config: ClientConfig, signer: Option<ProducerSigner>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            config,
            signer: signer.map(Arc::new),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.broker_url, path)
    }

    fn with_consumer_token(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.consumer_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    fn signed_headers(&self, body: &[u8]) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(signer) = &self.signer {
            let source = HeaderValue::from_str(&self.config.source_id)
                .map_err(|e| BusError::Connect(format!("invalid source id header: {e}")))?;
            let signature = HeaderValue::from_str(&signer.sign(body))
                .map_err(|e| BusError::Connect(format!("invalid signature header: {e}")))?;
            headers.insert(SOURCE_ID_HEADER, source);
            headers.insert(SIGNATURE_HEADER, signature);
        }
        Ok(headers)
    }
}

/// Maps a non-success response to a [`BusError`].
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let body: Option<ErrorBody> = serde_json::from_str(&text).ok();
    let (message, code) = match body {
        Some(body) => (body.error, body.code),
        None => (text, None),
    };

    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(BusError::Unauthorized(message));
    }
    Err(BusError::broker(status.as_u16(), code, message))
}

#[async_trait]
impl BusTransport for HttpTransport {
    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url("/health"))
            .timeout(self.config.connect_timeout)
            .send()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        check(response).await?;
        Ok(())
    }

    async fn create_topics(&self, topics: &[String]) -> Result<()> {
        let request = CreateTopicsRequest {
            topics: topics.to_vec(),
            partitions: None,
        };
        let response = self
            .with_consumer_token(self.client.post(self.url("/topics")))
            .timeout(self.config.request_timeout)
            .json(&request)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn append(
        &self,
        topic: &str,
        key: Option<String>,
        value: Value,
    ) -> Result<RecordMetadata> {
        let body = serde_json::to_vec(&PublishRequest { key, value })?;
        let headers = self.signed_headers(&body)?;

        debug!(topic, bytes = body.len(), "Publishing record");

        let response = self
            .client
            .post(self.url(&format!("/topics/{topic}/records")))
            .timeout(self.config.request_timeout)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn fetch(&self, request: FetchRequest) -> Result<Vec<Record>> {
        let timeout = self.config.request_timeout + Duration::from_millis(request.wait_ms);
        let response = self
            .with_consumer_token(self.client.post(self.url("/fetch")))
            .timeout(timeout)
            .json(&request)
            .send()
            .await?;
        let body: FetchResponse = check(response).await?.json().await?;
        Ok(body.records)
    }

    async fn offsets(&self, group: &str, topics: &[String]) -> Result<Vec<GroupOffset>> {
        let response = self
            .with_consumer_token(
                self.client
                    .get(self.url(&format!("/groups/{group}/offsets")))
                    .query(&[("topics", topics.join(","))]),
            )
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let body: OffsetsResponse = check(response).await?.json().await?;
        Ok(body.offsets)
    }

    async fn commit(&self, group: &str, offsets: &[PartitionOffset]) -> Result<()> {
        let request = CommitRequest {
            offsets: offsets.to_vec(),
        };
        let response = self
            .with_consumer_token(
                self.client
                    .post(self.url(&format!("/groups/{group}/commit"))),
            )
            .timeout(self.config.request_timeout)
            .json(&request)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

/// A service's handle on the event bus.
pub struct BusClient {
    transport: Arc<dyn BusTransport>,
    client_id: String,
    connect_timeout: Duration,
    connected: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl BusClient {
    /// Creates a disconnected client over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self {
            transport,
            client_id: default_source_id(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connected: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Creates a client for the broker described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Http`] if the HTTP client cannot be built.
    pub fn http(config: ClientConfig, signer: Option<ProducerSigner>) -> Result<Self> {
        let client_id = config.source_id.clone();
        let connect_timeout = config.connect_timeout;
        let transport = HttpTransport::new(config, signer)?;
        Ok(Self::new(Arc::new(transport))
            .with_client_id(client_id)
            .with_connect_timeout(connect_timeout))
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn BusTransport> {
        Arc::clone(&self.transport)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Checks the broker is reachable within the connect timeout.
    ///
    /// A failure is returned to the caller and never retried here.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectTimeout`] or the transport's error.
    pub async fn connect(&self) -> Result<()> {
        match tokio::time::timeout(self.connect_timeout, self.transport.ping()).await {
            Ok(Ok(())) => {
                self.connected.store(true, Ordering::Release);
                info!(client_id = %self.client_id, "Connected to event bus");
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(client_id = %self.client_id, error = %err, "Event bus connection failed");
                Err(err)
            }
            Err(_) => {
                warn!(
                    client_id = %self.client_id,
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "Event bus connection timed out"
                );
                Err(BusError::ConnectTimeout(self.connect_timeout))
            }
        }
    }

    /// Stops every subscription (committing its last batch) and marks the
    /// client disconnected. Safe to call repeatedly or after a failed
    /// connect.
    pub async fn disconnect(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        let stopped = subscriptions.len();
        for subscription in subscriptions {
            subscription.stop().await;
        }

        if self.connected.swap(false, Ordering::AcqRel) || stopped > 0 {
            info!(client_id = %self.client_id, subscriptions = stopped, "Disconnected from event bus");
        }
    }

    /// Publishes `value` as a structured record.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NotConnected`] before [`connect`](Self::connect),
    /// [`BusError::Serialization`] if `value` cannot be encoded, or the
    /// transport's error.
    pub async fn publish<T>(&self, topic: &str, key: Option<&str>, value: &T) -> Result<RecordMetadata>
    where
        T: Serialize + ?Sized + Sync,
    {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let value = serde_json::to_value(value)?;
        let metadata = self
            .transport
            .append(topic, key.map(ToString::to_string), value)
            .await?;

        debug!(
            topic = %metadata.topic,
            partition = metadata.partition,
            offset = metadata.offset,
            "Published record"
        );
        Ok(metadata)
    }

    /// Starts a consumer-group subscription owned by this client.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NotConnected`] before [`connect`](Self::connect),
    /// or the error raised while resolving the group's starting positions.
    pub async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let subscription = Subscription::start(self.transport(), options, handler).await?;
        self.subscriptions.lock().await.push(subscription);
        Ok(())
    }

    /// Number of live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("client_id", &self.client_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
