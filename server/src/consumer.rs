//! Applies bus records to a [`SessionStore`].
//!
//! Records are dispatched by [`Topic`]: session events drive the store's
//! state machine, domain events are logged, and anything on an unknown
//! topic is dropped. Undecodable payloads are reported to the subscription
//! loop, which logs and skips them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use authbus_bus::{BusClient, BusError, HandlerError, Record, RecordHandler, SubscribeOptions};

use crate::events::{DomainEvent, SessionEvent, Topic};
use crate::session::{EventPosition, SessionStore, Transition};

/// Counters exposed on health endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStats {
    pub applied: u64,
    pub stale: u64,
    pub malformed: u64,
    pub domain: u64,
}

#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    stale: AtomicU64,
    malformed: AtomicU64,
    domain: AtomicU64,
}

/// Record handler that keeps one store in sync with `session-events`.
#[derive(Debug)]
pub struct SessionEventConsumer {
    store: Arc<SessionStore>,
    counters: Counters,
}

impl SessionEventConsumer {
    #[must_use]
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            counters: Counters::default(),
        }
    }

    /// Subscribes `consumer` to every known topic under `group`.
    ///
    /// # Errors
    ///
    /// Returns the bus error if the subscription cannot be started.
    pub async fn subscribe(
        consumer: Arc<Self>,
        client: &BusClient,
        group: &str,
    ) -> Result<(), BusError> {
        let options = SubscribeOptions::new(group, Topic::all_names());
        client.subscribe(options, consumer).await?;
        info!(group, "Session event consumer subscribed");
        Ok(())
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            domain: self.counters.domain.load(Ordering::Relaxed),
        }
    }

    fn decode<T: DeserializeOwned>(&self, record: &Record) -> Result<T, HandlerError> {
        serde_json::from_value(record.value.clone()).map_err(|e| {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            HandlerError::Malformed(e.to_string())
        })
    }

    fn apply_session(&self, event: &SessionEvent, position: EventPosition) {
        match self.store.apply_at(event, Some(position)) {
            Transition::Applied { from, to } => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                info!(
                    kind = ?event.kind,
                    user_id = %event.user_id,
                    ?from,
                    ?to,
                    "Session event applied"
                );
            }
            Transition::Stale { current } => {
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
                debug!(
                    kind = ?event.kind,
                    user_id = %event.user_id,
                    ?current,
                    partition = position.partition,
                    offset = position.offset,
                    "Ignoring replayed session event"
                );
            }
        }
    }

    fn log_domain(&self, topic: Topic, event: &DomainEvent) {
        self.counters.domain.fetch_add(1, Ordering::Relaxed);
        if !event.kind.is_known() {
            warn!(%topic, kind = %event.kind, "Unrecognised domain event kind");
            return;
        }
        let entity = event.entity();
        info!(
            %topic,
            kind = %event.kind,
            user_id = event.user_id.as_deref().unwrap_or("-"),
            entity_id = entity.as_deref().unwrap_or("-"),
            "Domain event received"
        );
    }
}

#[async_trait]
impl RecordHandler for SessionEventConsumer {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        match Topic::parse(&record.topic) {
            Some(Topic::SessionEvents) => {
                let event: SessionEvent = self.decode(record)?;
                self.apply_session(&event, EventPosition::new(record.partition, record.offset));
            }
            Some(topic @ (Topic::TodoEvents | Topic::CategoryEvents | Topic::UserEvents)) => {
                let event: DomainEvent = self.decode(record)?;
                self.log_domain(topic, &event);
            }
            None => {
                warn!(
                    topic = %record.topic,
                    offset = record.offset,
                    "Dropping record from unknown topic"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    use crate::events::SessionEventKind;
    use crate::session::SessionState;

    fn record(topic: &str, offset: u64, value: Value) -> Record {
        Record {
            topic: topic.to_string(),
            partition: 0,
            offset,
            key: None,
            value,
            timestamp: Utc::now(),
        }
    }

    fn session(kind: &str, user: Value, secs: i64) -> Value {
        let ts = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        json!({"type": kind, "userId": user, "username": "alice", "timestamp": ts})
    }

    fn consumer() -> SessionEventConsumer {
        SessionEventConsumer::new(Arc::new(SessionStore::new()))
    }

    #[tokio::test]
    async fn login_then_logout_deactivates() {
        let consumer = consumer();
        consumer
            .handle(&record("session-events", 0, session("LOGIN", json!(1), 0)))
            .await
            .unwrap();
        assert!(consumer.store().is_active("1"));

        consumer
            .handle(&record("session-events", 1, session("LOGOUT", json!("1"), 1)))
            .await
            .unwrap();
        assert_eq!(consumer.store().state("1"), SessionState::Inactive);
        assert_eq!(consumer.stats().applied, 2);
    }

    #[tokio::test]
    async fn redelivered_login_is_idempotent() {
        let consumer = consumer();
        let login = record("session-events", 0, session("LOGIN", json!("5"), 0));
        consumer.handle(&login).await.unwrap();
        let before = consumer.store().get("5").unwrap();

        consumer.handle(&login).await.unwrap();
        let after = consumer.store().get("5").unwrap();
        assert!(after.active);
        assert_eq!(after.issued_at, before.issued_at);
        assert_eq!(consumer.store().len(), 1);
    }

    #[tokio::test]
    async fn replayed_login_after_logout_does_not_reactivate() {
        let consumer = consumer();
        let login = record("session-events", 0, session("LOGIN", json!("9"), 0));
        consumer.handle(&login).await.unwrap();
        consumer
            .handle(&record("session-events", 1, session("LOGOUT", json!("9"), 1)))
            .await
            .unwrap();

        // Redelivered after a restart that lost the commit.
        consumer.handle(&login).await.unwrap();

        assert!(!consumer.store().is_active("9"));
        assert_eq!(consumer.stats().stale, 1);
    }

    #[tokio::test]
    async fn logout_stamped_before_login_still_revokes() {
        let consumer = consumer();
        consumer
            .handle(&record("session-events", 0, session("LOGIN", json!("3"), 10)))
            .await
            .unwrap();
        consumer
            .handle(&record("session-events", 1, session("LOGOUT", json!("3"), 9)))
            .await
            .unwrap();

        assert_eq!(consumer.store().state("3"), SessionState::Inactive);
        assert_eq!(consumer.stats().stale, 0);
    }

    #[tokio::test]
    async fn malformed_session_event_is_rejected_not_fatal() {
        let consumer = consumer();
        let err = consumer
            .handle(&record("session-events", 0, json!({"type": "DANCE"})))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Malformed(_)));
        assert_eq!(consumer.stats().malformed, 1);
        assert!(consumer.store().is_empty());

        // The consumer keeps working afterwards.
        consumer
            .handle(&record("session-events", 1, session("LOGIN", json!("2"), 0)))
            .await
            .unwrap();
        assert!(consumer.store().is_active("2"));
    }

    #[tokio::test]
    async fn domain_events_do_not_touch_sessions() {
        let consumer = consumer();
        consumer
            .handle(&record(
                "todo-events",
                0,
                json!({"type": "TODO_DELETED", "todoId": 4, "userId": 1}),
            ))
            .await
            .unwrap();
        consumer
            .handle(&record("user-events", 0, json!({"type": "USER_BANNED", "userId": 1})))
            .await
            .unwrap();

        assert!(consumer.store().is_empty());
        assert_eq!(consumer.stats().domain, 2);
    }

    #[tokio::test]
    async fn unknown_topic_is_dropped() {
        let consumer = consumer();
        consumer
            .handle(&record("payment-events", 0, json!({"type": "LOGIN", "userId": 1})))
            .await
            .unwrap();
        assert!(consumer.store().is_empty());
        assert_eq!(consumer.stats(), ConsumerStats::default());
    }

    #[tokio::test]
    async fn subscribes_through_local_bus() {
        use authbus_bus::log::PartitionedLog;
        use authbus_bus::LocalTransport;
        use std::time::Duration;

        let log = Arc::new(PartitionedLog::default());
        let client = BusClient::new(Arc::new(LocalTransport::new(Arc::clone(&log))));
        client.connect().await.unwrap();

        let consumer = Arc::new(consumer());
        SessionEventConsumer::subscribe(Arc::clone(&consumer), &client, "test-group")
            .await
            .unwrap();

        let event = SessionEvent::new(SessionEventKind::Login, "77", "zoe", Utc::now());
        client
            .publish("session-events", Some("77"), &event)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !consumer.store().is_active("77") {
            assert!(tokio::time::Instant::now() < deadline, "LOGIN never applied");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        client.disconnect().await;
    }
}
