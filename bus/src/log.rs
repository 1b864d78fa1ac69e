//! In-memory partitioned, append-only log with consumer-group offsets.
//!
//! # Architecture
//!
//! Each topic owns a fixed number of partitions. A partition is an ordered
//! vector of [`Record`]s; a record's offset is its index. Ordering is only
//! defined within a partition, so producers that need per-entity ordering
//! must supply a key: keyed records always land on `fnv1a(key) % partitions`.
//! Unkeyed records are spread over random partitions.
//!
//! Consumer groups store the *next* offset they will read per partition.
//! Commits never move a group backwards.
//!
//! # Thread Safety
//!
//! All state lives behind [`RwLock`]s and no lock is held across an `.await`,
//! so the log can be shared through an `Arc` between the broker's request
//! handlers and any number of in-process consumers.
//!
//! # Example
//!
//! ```rust
//! use authbus_bus::log::PartitionedLog;
//! use serde_json::json;
//!
//! let log = PartitionedLog::new(3);
//! let meta = log
//!     .append("session-events", Some("42".to_string()), json!({"type": "LOGIN"}))
//!     .unwrap();
//!
//! let records = log.fetch("session-events", meta.partition, 0, 10).unwrap();
//! assert_eq!(records.len(), 1);
//! ```

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::broadcast::{AppendBroadcaster, TopicFilter};
use crate::types::{
    is_valid_topic_name, GroupOffset, PartitionOffset, Record, RecordMetadata,
};

/// Partition count used when a topic is auto-created.
pub const DEFAULT_PARTITIONS: u32 = 3;

/// Upper bound on partitions per topic.
pub const MAX_PARTITIONS: u32 = 64;

/// Errors raised by log operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogError {
    /// The topic has never been created.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// The partition index is outside the topic's partition range.
    #[error("unknown partition {partition} for topic {topic}")]
    UnknownPartition { topic: String, partition: u32 },

    /// The topic name contains illegal characters or has a bad length.
    #[error("invalid topic name: {0:?}")]
    InvalidTopicName(String),

    /// The requested partition count is zero or above [`MAX_PARTITIONS`].
    #[error("invalid partition count {0} (must be 1..={MAX_PARTITIONS})")]
    InvalidPartitionCount(u32),

    /// A commit pointed past the end of a partition.
    #[error("offset {offset} is beyond end {end} of {topic}/{partition}")]
    OffsetOutOfRange {
        topic: String,
        partition: u32,
        offset: u64,
        end: u64,
    },
}

impl LogError {
    /// Machine-readable code used in broker error responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownTopic(_) => "unknown_topic",
            Self::UnknownPartition { .. } => "unknown_partition",
            Self::InvalidTopicName(_) => "invalid_topic",
            Self::InvalidPartitionCount(_) => "invalid_partitions",
            Self::OffsetOutOfRange { .. } => "offset_out_of_range",
        }
    }
}

type Partitions = Vec<Vec<Record>>;
type GroupPositions = HashMap<(String, u32), u64>;

/// Thread-safe partitioned log.
pub struct PartitionedLog {
    topics: RwLock<HashMap<String, Partitions>>,
    groups: RwLock<HashMap<String, GroupPositions>>,
    default_partitions: u32,
    appends: AppendBroadcaster,
}

impl PartitionedLog {
    /// Creates an empty log whose auto-created topics get `default_partitions`.
    ///
    /// Values outside `1..=MAX_PARTITIONS` are clamped into range.
    #[must_use]
    pub fn new(default_partitions: u32) -> Self {
        let default_partitions = default_partitions.clamp(1, MAX_PARTITIONS);
        debug!(default_partitions, "Creating partitioned log");
        Self {
            topics: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            default_partitions,
            appends: AppendBroadcaster::new(),
        }
    }

    /// Creates a topic if it does not exist yet.
    ///
    /// Returns `true` if the topic was created and `false` if it already
    /// existed (its partition count is left untouched).
    ///
    /// # Errors
    ///
    /// Returns [`LogError::InvalidTopicName`] or
    /// [`LogError::InvalidPartitionCount`].
    pub fn create_topic(&self, name: &str, partitions: Option<u32>) -> Result<bool, LogError> {
        if !is_valid_topic_name(name) {
            return Err(LogError::InvalidTopicName(name.to_string()));
        }
        let partitions = partitions.unwrap_or(self.default_partitions);
        if partitions == 0 || partitions > MAX_PARTITIONS {
            return Err(LogError::InvalidPartitionCount(partitions));
        }

        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if topics.contains_key(name) {
            return Ok(false);
        }
        topics.insert(name.to_string(), vec![Vec::new(); partitions as usize]);
        debug!(topic = %name, partitions, "Created topic");
        Ok(true)
    }

    /// Names of all topics, sorted.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of partitions of `topic`, if it exists.
    #[must_use]
    pub fn partition_count(&self, topic: &str) -> Option<u32> {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.get(topic).map(|p| p.len() as u32)
    }

    /// Appends a record, creating the topic on first use.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::InvalidTopicName`] for illegal topic names.
    pub fn append(
        &self,
        topic: &str,
        key: Option<String>,
        value: Value,
    ) -> Result<RecordMetadata, LogError> {
        self.create_topic(topic, None)?;

        let metadata = {
            let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
            let partitions = topics
                .get_mut(topic)
                .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;

            let partition = match key.as_deref() {
                Some(key) => partition_for_key(key, partitions.len() as u32),
                None => rand::rng().random_range(0..partitions.len() as u32),
            };
            let log = &mut partitions[partition as usize];
            let offset = log.len() as u64;

            log.push(Record {
                topic: topic.to_string(),
                partition,
                offset,
                key,
                value,
                timestamp: Utc::now(),
            });

            RecordMetadata {
                topic: topic.to_string(),
                partition,
                offset,
            }
        };

        trace!(
            topic = %metadata.topic,
            partition = metadata.partition,
            offset = metadata.offset,
            "Appended record"
        );
        self.appends.announce(metadata.clone());
        Ok(metadata)
    }

    /// Reads up to `max` records of one partition starting at `offset`.
    ///
    /// An offset at or past the end yields an empty vector.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownTopic`] or [`LogError::UnknownPartition`].
    pub fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max: usize,
    ) -> Result<Vec<Record>, LogError> {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        let log = partition_of(&topics, topic, partition)?;

        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(log.len());
        let end = start.saturating_add(max).min(log.len());
        Ok(log[start..end].to_vec())
    }

    /// Reads from several positions at once, up to `max` records in total.
    ///
    /// Unknown topics and partitions are skipped with a warning so that one
    /// bad position cannot starve the rest of the request.
    #[must_use]
    pub fn fetch_many(&self, positions: &[PartitionOffset], max: usize) -> Vec<Record> {
        let mut records = Vec::new();
        for position in positions {
            let remaining = max.saturating_sub(records.len());
            if remaining == 0 {
                break;
            }
            match self.fetch(&position.topic, position.partition, position.offset, remaining) {
                Ok(mut batch) => records.append(&mut batch),
                Err(err) => {
                    warn!(error = %err, "Skipping unreadable fetch position");
                }
            }
        }
        records
    }

    /// Like [`fetch_many`](Self::fetch_many), but waits up to `wait` for a
    /// matching append when nothing is immediately available.
    pub async fn poll(
        &self,
        positions: &[PartitionOffset],
        max: usize,
        wait: Duration,
    ) -> Vec<Record> {
        // Subscribe before the first read so an append racing with it still
        // wakes us.
        let mut rx = self.appends.subscribe();
        let records = self.fetch_many(positions, max);
        if !records.is_empty() || wait.is_zero() || positions.is_empty() {
            return records;
        }

        let filter: TopicFilter = positions.iter().map(|p| p.topic.clone()).collect();
        let deadline = Instant::now() + wait;

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(metadata)) if filter.matches(&metadata) => break,
                Ok(Ok(_)) => continue,
                // Missed announcements may include ours; just re-read.
                Ok(Err(RecvError::Lagged(_))) => break,
                Ok(Err(RecvError::Closed)) | Err(_) => return Vec::new(),
            }
        }

        self.fetch_many(positions, max)
    }

    /// Next offset per partition of `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownTopic`].
    pub fn end_offsets(&self, topic: &str) -> Result<Vec<u64>, LogError> {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        let partitions = topics
            .get(topic)
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;
        Ok(partitions.iter().map(|p| p.len() as u64).collect())
    }

    /// Stores `offset` as the next position of `group` on a partition.
    ///
    /// Returns the stored position, which is the larger of the previous
    /// commit and `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownTopic`], [`LogError::UnknownPartition`] or
    /// [`LogError::OffsetOutOfRange`] when `offset` is past the partition end.
    pub fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: u64,
    ) -> Result<u64, LogError> {
        let end = {
            let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
            partition_of(&topics, topic, partition)?.len() as u64
        };
        if offset > end {
            return Err(LogError::OffsetOutOfRange {
                topic: topic.to_string(),
                partition,
                offset,
                end,
            });
        }

        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        let positions = groups.entry(group.to_string()).or_default();
        let stored = positions
            .entry((topic.to_string(), partition))
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);

        trace!(group, topic, partition, offset = *stored, "Committed offset");
        Ok(*stored)
    }

    /// Stored positions of `group` on `topic`, keyed by partition.
    ///
    /// Partitions the group never committed are absent.
    #[must_use]
    pub fn committed(&self, group: &str, topic: &str) -> HashMap<u32, u64> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups
            .get(group)
            .map(|positions| {
                positions
                    .iter()
                    .filter(|((t, _), _)| t == topic)
                    .map(|((_, partition), offset)| (*partition, *offset))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Committed and end offsets of every partition of `topic` for `group`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownTopic`].
    pub fn group_offsets(&self, group: &str, topic: &str) -> Result<Vec<GroupOffset>, LogError> {
        let ends = self.end_offsets(topic)?;
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        let positions = groups.get(group);

        Ok(ends
            .into_iter()
            .enumerate()
            .map(|(partition, end)| {
                let partition = partition as u32;
                GroupOffset {
                    topic: topic.to_string(),
                    partition,
                    committed: positions
                        .and_then(|p| p.get(&(topic.to_string(), partition)))
                        .copied(),
                    end,
                }
            })
            .collect())
    }

    /// Total number of records across all topics.
    #[must_use]
    pub fn record_count(&self) -> usize {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.values().flatten().map(Vec::len).sum()
    }

    /// Broadcaster announcing every append.
    #[must_use]
    pub fn appends(&self) -> &AppendBroadcaster {
        &self.appends
    }
}

impl Default for PartitionedLog {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl std::fmt::Debug for PartitionedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedLog")
            .field("topics", &self.topic_names())
            .field("default_partitions", &self.default_partitions)
            .finish()
    }
}

fn partition_of<'a>(
    topics: &'a HashMap<String, Partitions>,
    topic: &str,
    partition: u32,
) -> Result<&'a Vec<Record>, LogError> {
    topics
        .get(topic)
        .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?
        .get(partition as usize)
        .ok_or_else(|| LogError::UnknownPartition {
            topic: topic.to_string(),
            partition,
        })
}

/// Maps a record key to a partition with 32-bit FNV-1a.
///
/// The hash is fixed so every producer process, whatever its build, sends
/// the same key to the same partition.
#[must_use]
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let hash = key
        .bytes()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(PRIME));
    hash % partitions.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn create_topic_is_idempotent() {
        let log = PartitionedLog::new(2);
        assert!(log.create_topic("session-events", None).unwrap());
        assert!(!log.create_topic("session-events", Some(8)).unwrap());
        assert_eq!(log.partition_count("session-events"), Some(2));
    }

    #[test]
    fn create_topic_rejects_bad_input() {
        let log = PartitionedLog::default();
        assert!(matches!(
            log.create_topic("bad topic", None),
            Err(LogError::InvalidTopicName(_))
        ));
        assert!(matches!(
            log.create_topic("t", Some(0)),
            Err(LogError::InvalidPartitionCount(0))
        ));
        assert!(matches!(
            log.create_topic("t", Some(MAX_PARTITIONS + 1)),
            Err(LogError::InvalidPartitionCount(_))
        ));
    }

    #[test]
    fn append_auto_creates_topic_and_assigns_offsets() {
        let log = PartitionedLog::new(1);
        let first = log.append("todo-events", None, json!(1)).unwrap();
        let second = log.append("todo-events", None, json!(2)).unwrap();

        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 1);
        assert_eq!(log.end_offsets("todo-events").unwrap(), vec![2]);
        assert_eq!(log.record_count(), 2);
    }

    #[test]
    fn keyed_records_share_a_partition() {
        let log = PartitionedLog::new(8);
        let partitions: Vec<u32> = (0..20)
            .map(|i| {
                log.append("session-events", Some("user-7".to_string()), json!(i))
                    .unwrap()
                    .partition
            })
            .collect();

        assert!(partitions.iter().all(|p| *p == partitions[0]));
        assert_eq!(partitions[0], partition_for_key("user-7", 8));

        let records = log
            .fetch("session-events", partitions[0], 0, 100)
            .unwrap();
        let values: Vec<i64> = records.iter().map(|r| r.value.as_i64().unwrap()).collect();
        assert_eq!(values, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn partition_for_key_is_stable() {
        // FNV-1a("a") = 0xe40c292c
        assert_eq!(partition_for_key("a", u32::MAX), 0xe40c_292c % u32::MAX);
        assert_eq!(partition_for_key("anything", 1), 0);
        assert_eq!(partition_for_key("x", 0), 0);
    }

    #[test]
    fn fetch_respects_offset_and_max() {
        let log = PartitionedLog::new(1);
        for i in 0..5 {
            log.append("t", None, json!(i)).unwrap();
        }

        let records = log.fetch("t", 0, 2, 2).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 2);
        assert_eq!(records[1].offset, 3);

        assert!(log.fetch("t", 0, 99, 10).unwrap().is_empty());
        assert!(matches!(
            log.fetch("t", 5, 0, 10),
            Err(LogError::UnknownPartition { .. })
        ));
        assert!(matches!(
            log.fetch("missing", 0, 0, 10),
            Err(LogError::UnknownTopic(_))
        ));
    }

    #[test]
    fn fetch_many_skips_bad_positions() {
        let log = PartitionedLog::new(1);
        log.append("t", None, json!("a")).unwrap();

        let records = log.fetch_many(
            &[
                PartitionOffset::new("missing", 0, 0),
                PartitionOffset::new("t", 0, 0),
            ],
            10,
        );
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn commits_never_move_backwards() {
        let log = PartitionedLog::new(1);
        for i in 0..3 {
            log.append("t", None, json!(i)).unwrap();
        }

        assert_eq!(log.commit("g", "t", 0, 2).unwrap(), 2);
        assert_eq!(log.commit("g", "t", 0, 1).unwrap(), 2);
        assert_eq!(log.commit("g", "t", 0, 3).unwrap(), 3);
        assert_eq!(log.committed("g", "t").get(&0), Some(&3));
        assert!(log.committed("g", "other").is_empty());

        assert!(matches!(
            log.commit("g", "t", 0, 4),
            Err(LogError::OffsetOutOfRange { end: 3, .. })
        ));
    }

    #[test]
    fn group_offsets_report_committed_and_end() {
        let log = PartitionedLog::new(2);
        log.create_topic("t", None).unwrap();
        let meta = log.append("t", Some("k".to_string()), json!(0)).unwrap();
        log.commit("g", "t", meta.partition, 1).unwrap();

        let offsets = log.group_offsets("g", "t").unwrap();
        assert_eq!(offsets.len(), 2);
        let own = &offsets[meta.partition as usize];
        assert_eq!(own.committed, Some(1));
        assert_eq!(own.end, 1);
        let other = &offsets[1 - meta.partition as usize];
        assert_eq!(other.committed, None);
        assert_eq!(other.end, 0);

        let fresh = log.group_offsets("other-group", "t").unwrap();
        assert!(fresh.iter().all(|o| o.committed.is_none()));
    }

    #[tokio::test]
    async fn poll_returns_immediately_when_data_available() {
        let log = PartitionedLog::new(1);
        log.append("t", None, json!(1)).unwrap();

        let records = log
            .poll(&[PartitionOffset::new("t", 0, 0)], 10, Duration::from_secs(5))
            .await;
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn poll_times_out_with_nothing() {
        let log = PartitionedLog::new(1);
        log.create_topic("t", None).unwrap();

        let records = log
            .poll(&[PartitionOffset::new("t", 0, 0)], 10, Duration::from_millis(20))
            .await;
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn poll_wakes_on_matching_append() {
        let log = Arc::new(PartitionedLog::new(1));
        log.create_topic("t", None).unwrap();

        let writer = Arc::clone(&log);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("other", None, json!("ignored")).unwrap();
            writer.append("t", None, json!("wanted")).unwrap();
        });

        let records = log
            .poll(&[PartitionOffset::new("t", 0, 0)], 10, Duration::from_secs(5))
            .await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, json!("wanted"));
    }

    #[test]
    fn concurrent_appends_keep_offsets_dense() {
        let log = Arc::new(PartitionedLog::new(1));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for j in 0..50 {
                        log.append("t", None, json!([i, j])).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let records = log.fetch("t", 0, 0, 1000).unwrap();
        assert_eq!(records.len(), 400);
        for (index, record) in records.iter().enumerate() {
            assert_eq!(record.offset, index as u64);
        }
    }

    #[test]
    fn log_error_codes() {
        assert_eq!(LogError::UnknownTopic("t".into()).code(), "unknown_topic");
        assert_eq!(
            LogError::OffsetOutOfRange {
                topic: "t".into(),
                partition: 0,
                offset: 5,
                end: 1
            }
            .to_string(),
            "offset 5 is beyond end 1 of t/0"
        );
    }
}
