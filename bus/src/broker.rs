//! HTTP surface of the event bus broker.
//!
//! - `GET /health` - Liveness and log statistics
//! - `POST /topics` - Create topics if they do not exist
//! - `POST /topics/{topic}/records` - Append a record (producer-signed)
//! - `POST /fetch` - Read records, long-polling when none are ready
//! - `GET /groups/{group}/offsets` - Committed and end offsets of a group
//! - `POST /groups/{group}/commit` - Store a group's next read positions
//!
//! # Authentication
//!
//! Unless `unsafe_no_auth` is set, appends must carry `X-Source-ID` and
//! `X-Signature` headers that verify against the registered producer keys,
//! and every other mutating or reading endpoint needs
//! `Authorization: Bearer <consumer token>`.
//!
//! # Example
//!
//! ```rust,no_run
//! use authbus_bus::broker::{create_router, AppState};
//! use authbus_bus::config::BrokerConfig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = BrokerConfig::from_env().expect("failed to load config");
//!     let state = AppState::new(config).expect("invalid producer keys");
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:9400").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{bearer_token, validate_consumer_token, AuthError, ProducerKeys};
use crate::client::{SIGNATURE_HEADER, SOURCE_ID_HEADER};
use crate::config::{BrokerConfig, ConfigError};
use crate::log::{LogError, PartitionedLog};
use crate::types::{
    CommitRequest, CreateTopicsRequest, ErrorBody, FetchRequest, FetchResponse, OffsetsResponse,
    PublishRequest,
};

/// Maximum request body size (1 MiB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Upper bound on records returned by one fetch.
const MAX_FETCH_RECORDS: usize = 1000;

/// Shared broker state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BrokerConfig>,
    pub producer_keys: Arc<ProducerKeys>,
    pub log: Arc<PartitionedLog>,
    pub start_time: Instant,
}

impl AppState {
    /// Creates state with a fresh log and the configured topics.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a producer key or topic name is invalid.
    pub fn new(config: BrokerConfig) -> Result<Self, ConfigError> {
        let log = Arc::new(PartitionedLog::new(config.default_partitions));
        Self::with_log(config, log)
    }

    /// Creates state over an existing log.
    ///
    /// # Errors
    ///
    /// See [`AppState::new`].
    pub fn with_log(config: BrokerConfig, log: Arc<PartitionedLog>) -> Result<Self, ConfigError> {
        let producer_keys = config.producer_key_registry()?;
        for topic in &config.topics {
            log.create_topic(topic, None)
                .map_err(|e| ConfigError::invalid("AUTHBUS_TOPICS", e.to_string()))?;
        }

        Ok(Self {
            config: Arc::new(config),
            producer_keys: Arc::new(producer_keys),
            log,
            start_time: Instant::now(),
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("producers", &self.producer_keys.len())
            .field("log", &self.log)
            .finish()
    }
}

/// Creates the broker router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/topics", post(post_topics))
        .route("/topics/{topic}/records", post(post_record))
        .route("/fetch", post(post_fetch))
        .route("/groups/{group}/offsets", get(get_offsets))
        .route("/groups/{group}/commit", post(post_commit))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, body: ErrorBody) -> Response {
    (status, Json(body)).into_response()
}

fn log_error_response(err: &LogError) -> Response {
    let status = match err {
        LogError::UnknownTopic(_) | LogError::UnknownPartition { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    error_response(status, ErrorBody::new(err.to_string()).with_code(err.code()))
}

fn auth_error_response(err: &AuthError) -> Response {
    error_response(
        StatusCode::UNAUTHORIZED,
        ErrorBody::new(err.to_string()).with_code(err.code()),
    )
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        debug!(error = %e, "Rejecting malformed request body");
        error_response(
            StatusCode::BAD_REQUEST,
            ErrorBody::new(format!("invalid request body: {e}")).with_code("invalid_body"),
        )
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Checks the consumer bearer token.
fn authorize_consumer(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    if state.config.unsafe_no_auth {
        return Ok(());
    }

    let Some(expected) = state.config.consumer_token.as_deref() else {
        error!("Consumer token not configured but auth is enabled");
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorBody::new("server configuration error"),
        ));
    };

    let presented = header_str(headers, AUTHORIZATION.as_str()).and_then(bearer_token);
    validate_consumer_token(expected, presented).map_err(|err| {
        debug!(error = %err, "Consumer authentication failed");
        auth_error_response(&err)
    })
}

/// Checks the producer signature over the raw body.
fn authorize_producer(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), Response> {
    if state.config.unsafe_no_auth {
        return Ok(());
    }

    let Some(source_id) = header_str(headers, SOURCE_ID_HEADER) else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            ErrorBody::new("missing X-Source-ID header").with_code("missing_source"),
        ));
    };
    let Some(signature) = header_str(headers, SIGNATURE_HEADER) else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            ErrorBody::new("missing X-Signature header").with_code("missing_signature"),
        ));
    };

    state
        .producer_keys
        .verify(source_id, signature, body)
        .map_err(|err| {
            warn!(source = %source_id, error = %err, "Producer signature rejected");
            auth_error_response(&err)
        })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub topics: usize,
    pub records: usize,
    pub waiting_fetches: usize,
    pub uptime_seconds: u64,
}

async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        topics: state.log.topic_names().len(),
        records: state.log.record_count(),
        waiting_fetches: state.log.appends().waiter_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTopicsResponse {
    pub created: Vec<String>,
}

async fn post_topics(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(response) = authorize_consumer(&state, &headers) {
        return response;
    }
    let request: CreateTopicsRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let mut created = Vec::new();
    for topic in &request.topics {
        match state.log.create_topic(topic, request.partitions) {
            Ok(true) => created.push(topic.clone()),
            Ok(false) => {}
            Err(err) => return log_error_response(&err),
        }
    }

    if !created.is_empty() {
        info!(topics = ?created, "Topics created");
    }
    (StatusCode::CREATED, Json(CreateTopicsResponse { created })).into_response()
}

async fn post_record(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authorize_producer(&state, &headers, &body) {
        return response;
    }
    let request: PublishRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    match state.log.append(&topic, request.key, request.value) {
        Ok(metadata) => {
            debug!(
                topic = %metadata.topic,
                partition = metadata.partition,
                offset = metadata.offset,
                "Record accepted"
            );
            (StatusCode::ACCEPTED, Json(metadata)).into_response()
        }
        Err(err) => log_error_response(&err),
    }
}

async fn post_fetch(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(response) = authorize_consumer(&state, &headers) {
        return response;
    }
    let request: FetchRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let max = request.max_records.clamp(1, MAX_FETCH_RECORDS);
    let wait = Duration::from_millis(request.wait_ms).min(state.config.max_wait);

    let records = state.log.poll(&request.positions, max, wait).await;
    debug!(group = %request.group, records = records.len(), "Fetch served");

    Json(FetchResponse { records }).into_response()
}

#[derive(Debug, Deserialize)]
struct OffsetsQuery {
    topics: Option<String>,
}

async fn get_offsets(
    State(state): State<AppState>,
    Path(group): Path<String>,
    Query(query): Query<OffsetsQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authorize_consumer(&state, &headers) {
        return response;
    }

    let topics: Vec<String> = match query.topics.as_deref() {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect(),
        None => state.log.topic_names(),
    };

    let mut offsets = Vec::new();
    for topic in &topics {
        match state.log.group_offsets(&group, topic) {
            Ok(mut partitions) => offsets.append(&mut partitions),
            Err(err) => return log_error_response(&err),
        }
    }

    Json(OffsetsResponse { offsets }).into_response()
}

async fn post_commit(
    State(state): State<AppState>,
    Path(group): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authorize_consumer(&state, &headers) {
        return response;
    }
    let request: CommitRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    for position in &request.offsets {
        if let Err(err) =
            state
                .log
                .commit(&group, &position.topic, position.partition, position.offset)
        {
            warn!(group = %group, error = %err, "Commit rejected");
            return log_error_response(&err);
        }
    }

    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PartitionOffset, RecordMetadata};
    use axum::body::Body;
    use axum::http::Request;
    use base64::prelude::*;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::json;
    use std::collections::HashMap;
    use tower::ServiceExt;

    const TOKEN: &str = "consumer-token";

    fn test_keypair() -> (SigningKey, String) {
        let signing_key = SigningKey::from_bytes(&[42u8; 32]);
        let public = BASE64_STANDARD.encode(signing_key.verifying_key().to_bytes());
        (signing_key, public)
    }

    fn config(unsafe_no_auth: bool, public_key: Option<&str>) -> BrokerConfig {
        let mut producer_keys = HashMap::new();
        if let Some(key) = public_key {
            producer_keys.insert("auth-service".to_string(), key.to_string());
        }
        BrokerConfig {
            producer_keys,
            consumer_token: (!unsafe_no_auth).then(|| TOKEN.to_string()),
            port: 9400,
            default_partitions: 1,
            topics: vec!["session-events".to_string()],
            max_wait: Duration::from_millis(200),
            unsafe_no_auth,
        }
    }

    fn open_app() -> (AppState, Router) {
        let state = AppState::new(config(true, None)).unwrap();
        (state.clone(), create_router(state))
    }

    fn secured_app() -> (SigningKey, AppState, Router) {
        let (signing_key, public) = test_keypair();
        let state = AppState::new(config(false, Some(&public))).unwrap();
        (signing_key, state.clone(), create_router(state))
    }

    fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    async fn body_json<T: DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_configured_topics() {
        let (_, app) = open_app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthResponse = body_json(response).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.topics, 1);
        assert_eq!(health.records, 0);
    }

    #[tokio::test]
    async fn publish_then_fetch_without_auth() {
        let (state, app) = open_app();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/topics/session-events/records",
                &json!({"key": "1", "value": {"type": "LOGIN"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let meta: RecordMetadata = body_json(response).await;
        assert_eq!(meta.offset, 0);

        let response = app
            .oneshot(json_request(
                "POST",
                "/fetch",
                &json!({
                    "group": "g",
                    "positions": [{"topic": "session-events", "partition": 0, "offset": 0}],
                    "max_records": 10
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let fetched: FetchResponse = body_json(response).await;
        assert_eq!(fetched.records.len(), 1);
        assert_eq!(fetched.records[0].value, json!({"type": "LOGIN"}));
        assert_eq!(state.log.record_count(), 1);
    }

    #[tokio::test]
    async fn publish_rejects_invalid_topic_and_body() {
        let (_, app) = open_app();

        let response = app
            .clone()
            .oneshot(json_request("POST", "/topics/bad%20topic/records", &json!({"value": 1})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/topics/session-events/records")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.code.as_deref(), Some("invalid_body"));
    }

    #[tokio::test]
    async fn signed_publish_is_accepted() {
        let (signing_key, state, app) = secured_app();
        let body = serde_json::to_vec(&json!({"key": "9", "value": {"type": "LOGOUT"}})).unwrap();
        let signature = BASE64_STANDARD.encode(signing_key.sign(&body).to_bytes());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/topics/session-events/records")
                    .header(SOURCE_ID_HEADER, "auth-service")
                    .header(SIGNATURE_HEADER, signature)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(state.log.record_count(), 1);
    }

    #[tokio::test]
    async fn unsigned_or_forged_publish_is_rejected() {
        let (_, state, app) = secured_app();
        let body = serde_json::to_vec(&json!({"value": 1})).unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/topics/session-events/records")
                    .body(Body::from(body.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let err: ErrorBody = body_json(response).await;
        assert_eq!(err.code.as_deref(), Some("missing_source"));

        let forged = SigningKey::from_bytes(&[1u8; 32]);
        let signature = BASE64_STANDARD.encode(forged.sign(&body).to_bytes());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/topics/session-events/records")
                    .header(SOURCE_ID_HEADER, "auth-service")
                    .header(SIGNATURE_HEADER, signature)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let err: ErrorBody = body_json(response).await;
        assert_eq!(err.code.as_deref(), Some("invalid_signature"));
        assert_eq!(state.log.record_count(), 0);
    }

    #[tokio::test]
    async fn consumer_endpoints_require_bearer_token() {
        let (_, _, app) = secured_app();
        let fetch = json!({"group": "g", "positions": [], "max_records": 1});

        let response = app
            .clone()
            .oneshot(json_request("POST", "/fetch", &fetch))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut request = json_request("POST", "/fetch", &fetch);
        request
            .headers_mut()
            .insert(AUTHORIZATION, "Bearer wrong".parse().unwrap());
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut request = json_request("POST", "/fetch", &fetch);
        request
            .headers_mut()
            .insert(AUTHORIZATION, format!("Bearer {TOKEN}").parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn fetch_long_polls_until_append() {
        let (state, app) = open_app();

        let writer = Arc::clone(&state.log);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.append("session-events", None, json!("late")).unwrap();
        });

        let response = app
            .oneshot(json_request(
                "POST",
                "/fetch",
                &json!({
                    "group": "g",
                    "positions": [{"topic": "session-events", "partition": 0, "offset": 0}],
                    "max_records": 10,
                    "wait_ms": 60000
                }),
            ))
            .await
            .unwrap();
        let fetched: FetchResponse = body_json(response).await;
        assert_eq!(fetched.records.len(), 1);
    }

    #[tokio::test]
    async fn offsets_and_commit_round() {
        let (state, app) = open_app();
        state.log.append("session-events", None, json!(1)).unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/groups/gateway-group/commit",
                &json!({"offsets": [PartitionOffset::new("session-events", 0, 1)]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/groups/gateway-group/offsets?topics=session-events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let offsets: OffsetsResponse = body_json(response).await;
        assert_eq!(offsets.offsets.len(), 1);
        assert_eq!(offsets.offsets[0].committed, Some(1));
        assert_eq!(offsets.offsets[0].end, 1);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/groups/gateway-group/offsets?topics=missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn commit_past_end_is_rejected() {
        let (_, app) = open_app();
        let response = app
            .oneshot(json_request(
                "POST",
                "/groups/g/commit",
                &json!({"offsets": [{"topic": "session-events", "partition": 0, "offset": 5}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let err: ErrorBody = body_json(response).await;
        assert_eq!(err.code.as_deref(), Some("offset_out_of_range"));
    }

    #[tokio::test]
    async fn create_topics_reports_new_ones_only() {
        let (state, app) = open_app();
        let response = app
            .oneshot(json_request(
                "POST",
                "/topics",
                &json!({"topics": ["session-events", "todo-events"], "partitions": 4}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: CreateTopicsResponse = body_json(response).await;
        assert_eq!(created.created, vec!["todo-events".to_string()]);
        assert_eq!(state.log.partition_count("todo-events"), Some(4));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let (_, app) = open_app();
        let oversized = "x".repeat(MAX_BODY_SIZE + 1);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/topics/session-events/records")
                    .body(Body::from(oversized))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
