//! Consumer-group subscriptions with at-least-once dispatch.
//!
//! A [`Subscription`] owns a background task that repeatedly:
//!
//! 1. fetches records from the group's current positions (long-polling),
//! 2. hands each record to the [`RecordHandler`] in partition order,
//! 3. commits the advanced positions once the whole batch is handled.
//!
//! Because the commit follows the handling, a crash in between replays the
//! batch on the next start. Handlers must tolerate redelivery.
//!
//! Handler errors never stop the loop: the record is logged and skipped.
//! Transport errors back off exponentially (1s to 60s, ±25% jitter) and the
//! loop keeps going until stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::BusTransport;
use crate::error::Result;
use crate::types::{FetchRequest, PartitionOffset, Record};

/// Default maximum records per fetch.
pub const DEFAULT_MAX_RECORDS: usize = 100;

/// Default long-poll wait per fetch.
pub const DEFAULT_FETCH_WAIT: Duration = Duration::from_secs(5);

/// Initial retry delay after a transport error.
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Maximum retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Jitter factor applied to retry delays.
const JITTER_FACTOR: f64 = 0.25;

/// Why a handler gave up on a record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The record value could not be decoded.
    #[error("malformed record: {0}")]
    Malformed(String),

    /// The record was understood but could not be processed.
    #[error("handler failed: {0}")]
    Failed(String),
}

/// Callback invoked once per delivered record.
#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    /// Processes one record. Must be idempotent under redelivery.
    async fn handle(&self, record: &Record) -> std::result::Result<(), HandlerError>;
}

/// What and how to subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub group: String,
    pub topics: Vec<String>,

    /// Start at offset 0 when the group has no committed position.
    /// Otherwise a new group starts at the current end.
    pub from_beginning: bool,

    pub max_records: usize,
    pub fetch_wait: Duration,
    pub retry_delay: Duration,
}

impl SubscribeOptions {
    #[must_use]
    pub fn new<I, S>(group: impl Into<String>, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            group: group.into(),
            topics: topics.into_iter().map(Into::into).collect(),
            from_beginning: false,
            max_records: DEFAULT_MAX_RECORDS,
            fetch_wait: DEFAULT_FETCH_WAIT,
            retry_delay: INITIAL_RETRY_DELAY,
        }
    }

    #[must_use]
    pub fn from_beginning(mut self, from_beginning: bool) -> Self {
        self.from_beginning = from_beginning;
        self
    }

    #[must_use]
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self
    }

    #[must_use]
    pub fn with_fetch_wait(mut self, fetch_wait: Duration) -> Self {
        self.fetch_wait = fetch_wait;
        self
    }

    /// Sets the first retry delay after a transport error.
    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

/// A running subscription.
///
/// [`stop`](Self::stop) finishes the batch in flight, commits it and ends the
/// task. Dropping the subscription instead aborts the task immediately
/// without committing, which is how a crash looks to the broker.
pub struct Subscription {
    group: String,
    topics: Vec<String>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Resolves starting positions and spawns the dispatch loop.
    ///
    /// # Errors
    ///
    /// Returns a [`BusError`](crate::error::BusError) if topics cannot be
    /// created or the group's offsets cannot be read.
    pub async fn start(
        transport: Arc<dyn BusTransport>,
        options: SubscribeOptions,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<Self> {
        transport.create_topics(&options.topics).await?;
        let positions = resolve_positions(transport.as_ref(), &options).await?;
        transport.commit(&options.group, &positions).await?;

        info!(
            group = %options.group,
            topics = ?options.topics,
            partitions = positions.len(),
            from_beginning = options.from_beginning,
            "Subscription started"
        );

        let (stop, stop_rx) = watch::channel(false);
        let group = options.group.clone();
        let topics = options.topics.clone();
        let task = tokio::spawn(run(transport, options, handler, positions, stop_rx));

        Ok(Self {
            group,
            topics,
            stop,
            task: Some(task),
        })
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Returns `true` while the dispatch task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the loop after the current batch and waits for it to exit.
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(group = %self.group, error = %err, "Subscription task panicked");
                }
            }
        }
        debug!(group = %self.group, "Subscription stopped");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("group", &self.group)
            .field("topics", &self.topics)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn resolve_positions(
    transport: &dyn BusTransport,
    options: &SubscribeOptions,
) -> Result<Vec<PartitionOffset>> {
    let offsets = transport.offsets(&options.group, &options.topics).await?;
    Ok(offsets
        .into_iter()
        .map(|o| {
            let start = match o.committed {
                Some(committed) => committed,
                None if options.from_beginning => 0,
                None => o.end,
            };
            PartitionOffset::new(o.topic, o.partition, start)
        })
        .collect())
}

async fn run(
    transport: Arc<dyn BusTransport>,
    options: SubscribeOptions,
    handler: Arc<dyn RecordHandler>,
    mut positions: Vec<PartitionOffset>,
    mut stop: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(options.retry_delay);

    loop {
        if *stop.borrow() {
            break;
        }

        let request = FetchRequest {
            group: options.group.clone(),
            positions: positions.clone(),
            max_records: options.max_records,
            wait_ms: u64::try_from(options.fetch_wait.as_millis()).unwrap_or(u64::MAX),
        };

        let fetched = tokio::select! {
            _ = stop.changed() => break,
            result = transport.fetch(request) => result,
        };

        let records = match fetched {
            Ok(records) => {
                backoff.reset();
                records
            }
            Err(err) => {
                let delay = backoff.next_delay();
                warn!(
                    group = %options.group,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Fetch failed, backing off"
                );
                tokio::select! {
                    _ = stop.changed() => break,
                    () = tokio::time::sleep(delay) => continue,
                }
            }
        };

        if records.is_empty() {
            continue;
        }

        let advanced = dispatch_batch(&options.group, handler.as_ref(), &records, &mut positions).await;
        if advanced.is_empty() {
            continue;
        }

        if let Err(err) = transport.commit(&options.group, &advanced).await {
            // The batch will be redelivered after a restart.
            warn!(group = %options.group, error = %err, "Commit failed");
        }
    }

    debug!(group = %options.group, "Dispatch loop exited");
}

/// Hands every record to `handler` and advances `positions`.
///
/// Returns the positions that moved.
async fn dispatch_batch(
    group: &str,
    handler: &dyn RecordHandler,
    records: &[Record],
    positions: &mut [PartitionOffset],
) -> Vec<PartitionOffset> {
    let index: HashMap<(String, u32), usize> = positions
        .iter()
        .enumerate()
        .map(|(i, p)| ((p.topic.clone(), p.partition), i))
        .collect();
    let mut moved = Vec::new();

    for record in records {
        let Some(&slot) = index.get(&(record.topic.clone(), record.partition)) else {
            warn!(
                group,
                topic = %record.topic,
                partition = record.partition,
                "Dropping record from unsubscribed partition"
            );
            continue;
        };
        if record.offset < positions[slot].offset {
            continue;
        }

        if let Err(err) = handler.handle(record).await {
            warn!(
                group,
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %err,
                "Handler rejected record, skipping"
            );
        }

        positions[slot].offset = record.next_offset();
        if !moved.contains(&slot) {
            moved.push(slot);
        }
    }

    moved.into_iter().map(|slot| positions[slot].clone()).collect()
}

/// Exponential backoff with jitter, capped at one minute.
///
/// Used by the fetch loop and by callers that retry [`BusClient::connect`].
///
/// [`BusClient::connect`]: crate::client::BusClient::connect
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration) -> Self {
        Self {
            initial,
            current: initial,
        }
    }

    /// Jittered current delay; doubles the base for next time.
    pub fn next_delay(&mut self) -> Duration {
        let delay = add_jitter(self.current);
        self.current = (self.current * 2).min(MAX_RETRY_DELAY);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn add_jitter(duration: Duration) -> Duration {
    let base = duration.as_secs_f64();
    let range = base * JITTER_FACTOR;
    if range <= 0.0 {
        return duration;
    }
    let jitter = rand::rng().random_range(-range..=range);
    Duration::from_secs_f64((base + jitter).max(0.001))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
        reject: Option<u64>,
    }

    #[async_trait]
    impl RecordHandler for Recorder {
        async fn handle(&self, record: &Record) -> std::result::Result<(), HandlerError> {
            self.seen.lock().unwrap().push(record.offset);
            if self.reject == Some(record.offset) {
                return Err(HandlerError::Malformed("bad".into()));
            }
            Ok(())
        }
    }

    fn record(topic: &str, partition: u32, offset: u64) -> Record {
        Record {
            topic: topic.to_string(),
            partition,
            offset,
            key: None,
            value: json!({}),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dispatch_advances_positions_past_handled_records() {
        let handler = Recorder::default();
        let mut positions = vec![
            PartitionOffset::new("t", 0, 0),
            PartitionOffset::new("t", 1, 5),
        ];
        let records = vec![record("t", 0, 0), record("t", 0, 1), record("t", 1, 5)];

        let moved = dispatch_batch("g", &handler, &records, &mut positions).await;

        assert_eq!(*handler.seen.lock().unwrap(), vec![0, 1, 5]);
        assert_eq!(positions[0].offset, 2);
        assert_eq!(positions[1].offset, 6);
        assert_eq!(moved.len(), 2);
    }

    #[tokio::test]
    async fn dispatch_skips_failed_records_without_stalling() {
        let handler = Recorder {
            reject: Some(0),
            ..Recorder::default()
        };
        let mut positions = vec![PartitionOffset::new("t", 0, 0)];
        let records = vec![record("t", 0, 0), record("t", 0, 1)];

        let moved = dispatch_batch("g", &handler, &records, &mut positions).await;

        assert_eq!(*handler.seen.lock().unwrap(), vec![0, 1]);
        assert_eq!(moved, vec![PartitionOffset::new("t", 0, 2)]);
    }

    #[tokio::test]
    async fn dispatch_drops_unsubscribed_and_already_seen_records() {
        let handler = Recorder::default();
        let mut positions = vec![PartitionOffset::new("t", 0, 3)];
        let records = vec![record("other", 0, 0), record("t", 0, 2), record("t", 0, 3)];

        dispatch_batch("g", &handler, &records, &mut positions).await;

        assert_eq!(*handler.seen.lock().unwrap(), vec![3]);
        assert_eq!(positions[0].offset, 4);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current, MAX_RETRY_DELAY);

        backoff.reset();
        assert_eq!(backoff.current, Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(4);
        for _ in 0..200 {
            let secs = add_jitter(base).as_secs_f64();
            assert!((3.0..=5.0).contains(&secs), "jittered delay {secs} out of range");
        }
    }

    #[test]
    fn options_builder() {
        let options = SubscribeOptions::new("gateway-group", ["session-events"])
            .from_beginning(true)
            .with_max_records(0)
            .with_fetch_wait(Duration::from_millis(50));

        assert!(options.from_beginning);
        assert_eq!(options.max_records, 1);
        assert_eq!(options.fetch_wait, Duration::from_millis(50));
        assert_eq!(options.topics, vec!["session-events".to_string()]);
    }
}
