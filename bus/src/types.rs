//! Wire types for the AuthBus event bus.
//!
//! Records are immutable once appended. The broker and every client speak
//! these structures as JSON, so field names are part of the HTTP contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length of a topic name.
pub const MAX_TOPIC_NAME_LEN: usize = 249;

/// A single record stored in a topic partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Topic the record was appended to.
    pub topic: String,

    /// Partition within the topic.
    pub partition: u32,

    /// Position of the record within its partition.
    pub offset: u64,

    /// Partitioning key, if the producer supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// The structured message body.
    pub value: Value,

    /// Time the broker accepted the record.
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Returns the position a consumer should read next after this record.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.offset + 1
    }
}

/// Where a published record landed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// A read position: the next offset to consume from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionOffset {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

impl PartitionOffset {
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: u32, offset: u64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

/// Committed and end offsets of one partition, as seen by a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOffset {
    pub topic: String,
    pub partition: u32,

    /// Next offset the group will read, if it has committed before.
    pub committed: Option<u64>,

    /// Offset the next appended record will receive.
    pub end: u64,
}

/// Body of `POST /topics/{topic}/records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub value: Value,
}

/// Body of `POST /topics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTopicsRequest {
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<u32>,
}

/// Body of `POST /fetch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Consumer group issuing the fetch (informational, used for logging).
    pub group: String,

    /// Positions to read from, one per topic partition.
    pub positions: Vec<PartitionOffset>,

    /// Upper bound on the number of records returned.
    pub max_records: usize,

    /// How long the broker may hold the request open when nothing is available.
    #[serde(default)]
    pub wait_ms: u64,
}

/// Response of `POST /fetch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponse {
    pub records: Vec<Record>,
}

/// Response of `GET /groups/{group}/offsets`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OffsetsResponse {
    pub offsets: Vec<GroupOffset>,
}

/// Body of `POST /groups/{group}/commit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitRequest {
    pub offsets: Vec<PartitionOffset>,
}

/// JSON error body returned by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Returns `true` if `name` is a legal topic name.
///
/// Topic names are 1 to 249 characters drawn from ASCII letters, digits,
/// `.`, `_` and `-`.
#[must_use]
pub fn is_valid_topic_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TOPIC_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topic_names_follow_the_allowed_alphabet() {
        assert!(is_valid_topic_name("session-events"));
        assert!(is_valid_topic_name("todo_events.v1"));
        assert!(!is_valid_topic_name(""));
        assert!(!is_valid_topic_name("has space"));
        assert!(!is_valid_topic_name("slash/topic"));
        assert!(!is_valid_topic_name(&"a".repeat(MAX_TOPIC_NAME_LEN + 1)));
    }

    #[test]
    fn record_without_key_omits_field() {
        let record = Record {
            topic: "session-events".to_string(),
            partition: 1,
            offset: 7,
            key: None,
            value: json!({"type": "LOGIN"}),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("key").is_none());
        assert_eq!(record.next_offset(), 8);
    }

    #[test]
    fn fetch_request_defaults_wait_to_zero() {
        let request: FetchRequest = serde_json::from_value(json!({
            "group": "g",
            "positions": [],
            "max_records": 10
        }))
        .unwrap();
        assert_eq!(request.wait_ms, 0);
    }

    #[test]
    fn error_body_with_code() {
        let body = ErrorBody::new("unknown topic").with_code("unknown_topic");
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("unknown_topic"));

        let bare = serde_json::to_string(&ErrorBody::new("x")).unwrap();
        assert!(!bare.contains("code"));
    }
}
