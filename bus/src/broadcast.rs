//! Append notifications for long-polling fetchers.
//!
//! Every successful append is announced on a tokio broadcast channel. A fetch
//! that finds nothing to return subscribes, re-checks the log, and then waits
//! for an announcement that touches one of the topics it reads.
//!
//! Announcements carry only [`RecordMetadata`]; the record itself is always
//! read back from the log, so a lagging receiver loses wake-ups, never data.

use std::collections::HashSet;

use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, trace};

use crate::types::RecordMetadata;

/// Default channel capacity for append announcements.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Fan-out of append announcements to any number of waiting fetchers.
///
/// Cloning is cheap; all clones share the same channel.
#[derive(Debug, Clone)]
pub struct AppendBroadcaster {
    sender: Sender<RecordMetadata>,
}

impl AppendBroadcaster {
    /// Creates a broadcaster with [`DEFAULT_CHANNEL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a broadcaster with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        debug!(capacity, "Created append broadcaster");
        Self { sender }
    }

    /// Subscribes to announcements made after this call.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<RecordMetadata> {
        self.sender.subscribe()
    }

    /// Announces an append. Returns the number of waiting receivers.
    pub fn announce(&self, metadata: RecordMetadata) -> usize {
        trace!(
            topic = %metadata.topic,
            partition = metadata.partition,
            offset = metadata.offset,
            "Announcing append"
        );
        // No receivers just means nobody is long-polling right now.
        self.sender.send(metadata).unwrap_or(0)
    }

    /// Number of receivers currently subscribed.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for AppendBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Selects the announcements a waiting fetcher cares about.
///
/// An empty filter matches every announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicFilter {
    topics: HashSet<String>,
}

impl TopicFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a topic to the filter (builder pattern).
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.insert(topic.into());
        self
    }

    /// Returns `true` if the announcement concerns one of the filtered topics.
    #[must_use]
    pub fn matches(&self, metadata: &RecordMetadata) -> bool {
        self.topics.is_empty() || self.topics.contains(&metadata.topic)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for TopicFilter {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            topics: iter.into_iter().map(Into::into).collect(),
        }
    }
}
