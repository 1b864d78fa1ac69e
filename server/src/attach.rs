//! Joining the event bus at startup.
//!
//! The bus client never retries on its own. A service that starts while the
//! broker is down hands a [`BusAttachment`] to a background task, which
//! keeps trying with jittered exponential backoff until the client is
//! connected, the topics exist and the consumer is subscribed. Requests are
//! served the whole time; until the attachment completes, publishes report
//! `event_published: false` and session routes deny as not yet seen.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use authbus_bus::{Backoff, BusClient, BusError};

use crate::consumer::SessionEventConsumer;
use crate::producer::SessionEventProducer;

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The steps that put one service on the bus.
#[derive(Debug)]
pub struct BusAttachment {
    client: Arc<BusClient>,
    producer: Option<SessionEventProducer>,
    consumer: Option<(Arc<SessionEventConsumer>, String)>,
    retry_delay: Duration,
}

impl BusAttachment {
    #[must_use]
    pub fn new(client: Arc<BusClient>) -> Self {
        Self {
            client,
            producer: None,
            consumer: None,
            retry_delay: INITIAL_RETRY_DELAY,
        }
    }

    /// Create the known topics through `producer` once connected.
    #[must_use]
    pub fn with_topics(mut self, producer: SessionEventProducer) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Subscribe `consumer` under `group` once connected.
    #[must_use]
    pub fn with_consumer(
        mut self,
        consumer: Arc<SessionEventConsumer>,
        group: impl Into<String>,
    ) -> Self {
        self.consumer = Some((consumer, group.into()));
        self
    }

    /// First delay between attempts; it doubles up to one minute.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Retries until every step has succeeded once.
    pub async fn run(self) {
        let mut backoff = Backoff::new(self.retry_delay);
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.attach_once().await {
                Ok(()) => {
                    info!(attempts, "Attached to event bus");
                    return;
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(
                        attempts,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "Event bus attach failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn attach_once(&self) -> Result<(), BusError> {
        if !self.client.is_connected() {
            self.client.connect().await?;
        }
        if let Some(producer) = &self.producer {
            producer.ensure_topics().await?;
        }
        // Last, so a failure above never leaves a subscription behind.
        if let Some((consumer, group)) = &self.consumer {
            SessionEventConsumer::subscribe(Arc::clone(consumer), &self.client, group).await?;
        }
        Ok(())
    }
}
