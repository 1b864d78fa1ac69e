//! Local session store fed by `session-events`.
//!
//! Each service process keeps its own view of who is logged in. The view is
//! eventually consistent with the credential issuer: it changes only when
//! this process's consumer applies a [`SessionEvent`].
//!
//! # State Machine
//!
//! Per user, as seen by the consumer:
//!
//! | From | Event | To |
//! |------|-------|----|
//! | Unknown | LOGIN | Active |
//! | Unknown | LOGOUT | Inactive |
//! | Active | LOGIN | Active (refresh) |
//! | Active | LOGOUT | Inactive |
//! | Inactive | LOGIN | Active |
//! | Inactive | LOGOUT | Inactive |
//!
//! Records are never removed by events; logout only clears the active flag.
//!
//! Events are ordered by their position in the log, not by the producer's
//! clock. Producers key session events by user id, so one user's events share
//! a partition and their offsets give the issue order. When
//! [`SessionStore::apply_at`] sees an event from the same partition at a
//! lower offset than the last one applied for that user, the event is a
//! replay of history and is ignored. Re-applying the same offset is
//! idempotent. Events without a position, or from another partition, are
//! applied in arrival order.
//!
//! # Thread Safety
//!
//! The store uses a [`RwLock`] and never holds it across an `.await`, so it
//! can be shared through an `Arc` between request handlers and consumers.
//!
//! # Example
//!
//! ```rust
//! use authbus_server::events::SessionEvent;
//! use authbus_server::session::{SessionState, SessionStore};
//!
//! let store = SessionStore::new();
//! store.apply(&SessionEvent::login("42", "alice"));
//! assert!(store.is_active("42"));
//!
//! store.apply(&SessionEvent::logout("42", "alice"));
//! assert_eq!(store.state("42"), SessionState::Inactive);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::events::{SessionEvent, SessionEventKind};

/// What a store believes about one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No event for this user has been applied yet.
    Unknown,
    Active,
    Inactive,
}

/// Outcome of [`SessionStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { from: SessionState, to: SessionState },

    /// The event sits earlier in the log than the last applied one and was
    /// ignored.
    Stale { current: SessionState },
}

impl Transition {
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

/// Where a session event sits in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPosition {
    pub partition: u32,
    pub offset: u64,
}

impl EventPosition {
    #[must_use]
    pub fn new(partition: u32, offset: u64) -> Self {
        Self { partition, offset }
    }

    /// `true` if `self` is known to come before `other` in the log.
    fn precedes(self, other: Self) -> bool {
        self.partition == other.partition && self.offset < other.offset
    }
}

/// One user's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: String,
    pub username: String,

    /// Timestamp of the LOGIN that started the current session.
    pub issued_at: DateTime<Utc>,

    pub active: bool,

    /// Timestamp of the last applied event.
    pub last_event_at: DateTime<Utc>,

    /// Log position of the last applied event, when it came from the bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<EventPosition>,

    #[serde(skip, default = "Instant::now")]
    touched: Instant,
}

impl SessionRecord {
    #[must_use]
    pub fn new(user_id: impl Into<String>, username: impl Into<String>, issued_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            issued_at,
            active: true,
            last_event_at: issued_at,
            position: None,
            touched: Instant::now(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.active {
            SessionState::Active
        } else {
            SessionState::Inactive
        }
    }
}

/// Counts reported on health endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub known: usize,
    pub active: usize,
}

/// Thread-safe in-memory session store.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating session store");
        Self::default()
    }

    /// Inserts or overwrites a record.
    pub fn upsert(&self, mut record: SessionRecord) {
        record.touched = Instant::now();
        trace!(user_id = %record.user_id, active = record.active, "Upserting session");
        self.write().insert(record.user_id.clone(), record);
    }

    /// Clears the active flag of an existing record.
    ///
    /// Returns `false` (and does nothing) if the user is unknown.
    pub fn mark_inactive(&self, user_id: &str) -> bool {
        match self.write().get_mut(user_id) {
            Some(record) => {
                record.active = false;
                record.touched = Instant::now();
                true
            }
            None => false,
        }
    }

    /// `true` only for known users whose last applied event was a LOGIN.
    #[must_use]
    pub fn is_active(&self, user_id: &str) -> bool {
        self.read().get(user_id).is_some_and(|r| r.active)
    }

    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<SessionRecord> {
        self.read().get(user_id).cloned()
    }

    #[must_use]
    pub fn state(&self, user_id: &str) -> SessionState {
        self.read()
            .get(user_id)
            .map_or(SessionState::Unknown, SessionRecord::state)
    }

    /// Applies a session event atomically, in arrival order.
    pub fn apply(&self, event: &SessionEvent) -> Transition {
        self.apply_at(event, None)
    }

    /// Applies a session event read from the log at `position`.
    pub fn apply_at(&self, event: &SessionEvent, position: Option<EventPosition>) -> Transition {
        let mut sessions = self.write();

        if let Some(record) = sessions.get(&event.user_id) {
            if let (Some(incoming), Some(last)) = (position, record.position) {
                if incoming.precedes(last) {
                    debug!(
                        user_id = %event.user_id,
                        kind = ?event.kind,
                        partition = incoming.partition,
                        offset = incoming.offset,
                        last_offset = last.offset,
                        "Ignoring replayed session event"
                    );
                    return Transition::Stale {
                        current: record.state(),
                    };
                }
            }
        }

        let from = match sessions.get_mut(&event.user_id) {
            Some(record) => {
                let from = record.state();
                if event.kind == SessionEventKind::Login {
                    if !event.username.is_empty() {
                        record.username.clone_from(&event.username);
                    }
                    record.issued_at = event.timestamp;
                }
                record.active = event.kind == SessionEventKind::Login;
                record.last_event_at = event.timestamp;
                if position.is_some() {
                    record.position = position;
                }
                record.touched = Instant::now();
                from
            }
            None => {
                let mut record =
                    SessionRecord::new(&event.user_id, &event.username, event.timestamp);
                record.active = event.kind == SessionEventKind::Login;
                record.position = position;
                sessions.insert(event.user_id.clone(), record);
                SessionState::Unknown
            }
        };

        let to = match event.kind {
            SessionEventKind::Login => SessionState::Active,
            SessionEventKind::Logout => SessionState::Inactive,
        };
        trace!(user_id = %event.user_id, ?from, ?to, "Applied session event");
        Transition::Applied { from, to }
    }

    /// Removes inactive records untouched for longer than `retention`.
    ///
    /// Returns the number of records removed.
    pub fn evict_older_than(&self, retention: Duration) -> usize {
        let mut sessions = self.write();
        let before = sessions.len();
        sessions.retain(|_, r| r.active || r.touched.elapsed() < retention);
        before - sessions.len()
    }

    /// Spawns a task that runs [`evict_older_than`](Self::evict_older_than)
    /// every `interval`.
    pub fn spawn_eviction_task(
        self: &Arc<Self>,
        retention: Duration,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = store.evict_older_than(retention);
                if removed > 0 {
                    debug!(removed_count = removed, "Evicted inactive sessions");
                }
            }
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.read().values().filter(|r| r.active).count()
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let sessions = self.read();
        SessionStats {
            known: sessions.len(),
            active: sessions.values().filter(|r| r.active).count(),
        }
    }

    /// Copy of every record, sorted by user id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self.read().values().cloned().collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        records
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, SessionRecord>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SessionRecord>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}
