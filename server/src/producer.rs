//! Publishes session lifecycle and domain events.
//!
//! Publishing is fire-and-forget from the caller's point of view: a login
//! does not wait for any consumer, and a failed publish never undoes the
//! local state change that triggered it. Callers get the error back and
//! decide whether it matters.

use std::sync::Arc;

use tracing::{debug, warn};

use authbus_bus::{BusClient, BusError, RecordMetadata};

use crate::events::{DomainEvent, SessionEvent, Topic};

/// Wraps a [`BusClient`] for the credential-issuing side.
#[derive(Debug, Clone)]
pub struct SessionEventProducer {
    client: Arc<BusClient>,
}

impl SessionEventProducer {
    #[must_use]
    pub fn new(client: Arc<BusClient>) -> Self {
        Self { client }
    }

    /// Creates every topic this system uses if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the broker rejects the request.
    pub async fn ensure_topics(&self) -> Result<(), BusError> {
        self.client
            .transport()
            .create_topics(&Topic::all_names())
            .await
    }

    /// Announces a new session for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns the bus error; the event may not have reached any consumer.
    pub async fn login(&self, user_id: &str, username: &str) -> Result<RecordMetadata, BusError> {
        self.publish_session(SessionEvent::login(user_id, username)).await
    }

    /// Announces the end of `user_id`'s session.
    ///
    /// # Errors
    ///
    /// Returns the bus error; the event may not have reached any consumer.
    pub async fn logout(&self, user_id: &str, username: &str) -> Result<RecordMetadata, BusError> {
        self.publish_session(SessionEvent::logout(user_id, username)).await
    }

    /// Publishes a prepared session event, keyed by user id so one user's
    /// events stay in order.
    ///
    /// # Errors
    ///
    /// Returns the bus error.
    pub async fn publish_session(&self, event: SessionEvent) -> Result<RecordMetadata, BusError> {
        let result = self
            .client
            .publish(
                Topic::SessionEvents.as_str(),
                Some(event.user_id.as_str()),
                &event,
            )
            .await;

        match &result {
            Ok(meta) => debug!(
                kind = ?event.kind,
                user_id = %event.user_id,
                partition = meta.partition,
                offset = meta.offset,
                "Session event published"
            ),
            Err(err) => warn!(
                kind = ?event.kind,
                user_id = %event.user_id,
                error = %err,
                "Session event not published"
            ),
        }
        result
    }

    /// Publishes a domain event on `topic`. Keyed by user id when present.
    ///
    /// # Errors
    ///
    /// Returns the bus error.
    pub async fn publish_domain(
        &self,
        topic: Topic,
        event: &DomainEvent,
    ) -> Result<RecordMetadata, BusError> {
        let result = self
            .client
            .publish(topic.as_str(), event.user_id.as_deref(), event)
            .await;
        if let Err(err) = &result {
            warn!(topic = %topic, kind = %event.kind, error = %err, "Domain event not published");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authbus_bus::log::{partition_for_key, PartitionedLog};
    use authbus_bus::LocalTransport;
    use serde_json::json;

    use crate::events::{DomainEventKind, SessionEventKind};

    async fn connected() -> (SessionEventProducer, Arc<PartitionedLog>) {
        let log = Arc::new(PartitionedLog::default());
        let client = Arc::new(BusClient::new(Arc::new(LocalTransport::new(Arc::clone(&log)))));
        client.connect().await.unwrap();
        (SessionEventProducer::new(client), log)
    }

    #[tokio::test]
    async fn login_is_keyed_by_user_id() {
        let (producer, log) = connected().await;
        producer.ensure_topics().await.unwrap();

        let meta = producer.login("42", "alice").await.unwrap();
        let partitions = log.partition_count("session-events").unwrap();
        assert_eq!(meta.partition, partition_for_key("42", partitions));

        let records = log.fetch("session-events", meta.partition, meta.offset, 1).unwrap();
        let event: SessionEvent = serde_json::from_value(records[0].value.clone()).unwrap();
        assert_eq!(event.kind, SessionEventKind::Login);
        assert_eq!(event.user_id, "42");
        assert_eq!(records[0].value["type"], "LOGIN");
        assert_eq!(records[0].value["userId"], "42");
    }

    #[tokio::test]
    async fn logout_follows_login_on_same_partition() {
        let (producer, _log) = connected().await;
        let login = producer.login("7", "bob").await.unwrap();
        let logout = producer.logout("7", "bob").await.unwrap();

        assert_eq!(login.partition, logout.partition);
        assert!(logout.offset > login.offset);
    }

    #[tokio::test]
    async fn publish_before_connect_fails_without_side_effects() {
        let log = Arc::new(PartitionedLog::default());
        let client = Arc::new(BusClient::new(Arc::new(LocalTransport::new(Arc::clone(&log)))));
        let producer = SessionEventProducer::new(client);

        let err = producer.login("1", "alice").await.unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
        assert_eq!(log.record_count(), 0);
    }

    #[tokio::test]
    async fn domain_events_go_to_their_topic() {
        let (producer, log) = connected().await;
        let event = DomainEvent::new(DomainEventKind::TodoCreated, "3")
            .with_field("todo", json!({"id": 9, "title": "milk"}));

        let meta = producer.publish_domain(Topic::TodoEvents, &event).await.unwrap();
        assert_eq!(meta.topic, "todo-events");

        let records = log.fetch("todo-events", meta.partition, meta.offset, 1).unwrap();
        assert_eq!(records[0].value["type"], "TODO_CREATED");
        assert_eq!(records[0].value["todo"]["title"], "milk");
    }
}
