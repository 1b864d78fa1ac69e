//! Event types carried on the bus.
//!
//! Every topic carries JSON objects with a `type` discriminator. Session
//! events drive authorization; domain events (todo, category, user) are
//! informational and only logged.
//!
//! User ids are strings here. Producers that send numeric ids (the CRUD
//! services key users by integer) are accepted and normalised.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// The closed set of topics services exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    SessionEvents,
    TodoEvents,
    CategoryEvents,
    UserEvents,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::SessionEvents,
        Topic::TodoEvents,
        Topic::CategoryEvents,
        Topic::UserEvents,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionEvents => "session-events",
            Self::TodoEvents => "todo-events",
            Self::CategoryEvents => "category-events",
            Self::UserEvents => "user-events",
        }
    }

    /// Maps a topic name back to a [`Topic`]. Unknown names yield `None`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Names of every topic, for subscribing.
    #[must_use]
    pub fn all_names() -> Vec<String> {
        Self::ALL.iter().map(|t| t.as_str().to_string()).collect()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle transition announced by the credential issuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionEventKind {
    Login,
    Logout,
}

/// A `session-events` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub kind: SessionEventKind,

    #[serde(rename = "userId", deserialize_with = "string_or_number")]
    pub user_id: String,

    #[serde(default)]
    pub username: String,

    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    #[must_use]
    pub fn new(
        kind: SessionEventKind,
        user_id: impl Into<String>,
        username: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            user_id: user_id.into(),
            username: username.into(),
            timestamp,
        }
    }

    /// A `LOGIN` stamped now.
    #[must_use]
    pub fn login(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self::new(SessionEventKind::Login, user_id, username, Utc::now())
    }

    /// A `LOGOUT` stamped now.
    #[must_use]
    pub fn logout(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self::new(SessionEventKind::Logout, user_id, username, Utc::now())
    }
}

/// Kinds of domain events. Unrecognised kinds are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DomainEventKind {
    TodoCreated,
    TodoUpdated,
    TodoDeleted,
    CategoryCreated,
    CategoryUpdated,
    CategoryDeleted,
    UserRegistered,
    UserUpdated,
    Other(String),
}

impl DomainEventKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::TodoCreated => "TODO_CREATED",
            Self::TodoUpdated => "TODO_UPDATED",
            Self::TodoDeleted => "TODO_DELETED",
            Self::CategoryCreated => "CATEGORY_CREATED",
            Self::CategoryUpdated => "CATEGORY_UPDATED",
            Self::CategoryDeleted => "CATEGORY_DELETED",
            Self::UserRegistered => "USER_REGISTERED",
            Self::UserUpdated => "USER_UPDATED",
            Self::Other(kind) => kind,
        }
    }

    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl From<String> for DomainEventKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "TODO_CREATED" => Self::TodoCreated,
            "TODO_UPDATED" => Self::TodoUpdated,
            "TODO_DELETED" => Self::TodoDeleted,
            "CATEGORY_CREATED" => Self::CategoryCreated,
            "CATEGORY_UPDATED" => Self::CategoryUpdated,
            "CATEGORY_DELETED" => Self::CategoryDeleted,
            "USER_REGISTERED" => Self::UserRegistered,
            "USER_UPDATED" => Self::UserUpdated,
            _ => Self::Other(kind),
        }
    }
}

impl From<DomainEventKind> for String {
    fn from(kind: DomainEventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for DomainEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A todo, category or user mutation.
///
/// Fields other than `type`, `userId`, `entityId` and `timestamp` are kept
/// in `payload` as they were sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub kind: DomainEventKind,

    #[serde(
        rename = "userId",
        default,
        deserialize_with = "optional_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,

    #[serde(
        rename = "entityId",
        default,
        deserialize_with = "optional_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub entity_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl DomainEvent {
    #[must_use]
    pub fn new(kind: DomainEventKind, user_id: impl Into<String>) -> Self {
        Self {
            kind,
            user_id: Some(user_id.into()),
            entity_id: None,
            timestamp: Some(Utc::now()),
            payload: Map::new(),
        }
    }

    #[must_use]
    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.payload.insert(name.into(), value);
        self
    }

    /// The mutated entity's id: `entityId` if present, otherwise the first
    /// of `todoId`, `categoryId`, `todo.id` or `category.id`.
    #[must_use]
    pub fn entity(&self) -> Option<String> {
        if let Some(id) = &self.entity_id {
            return Some(id.clone());
        }
        let direct = ["todoId", "categoryId"]
            .iter()
            .find_map(|field| self.payload.get(*field));
        let nested = ["todo", "category"]
            .iter()
            .find_map(|field| self.payload.get(*field)?.get("id"));
        direct.or(nested).and_then(scalar_to_string)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

impl From<StringOrNumber> for String {
    fn from(value: StringOrNumber) -> Self {
        match value {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        }
    }
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    StringOrNumber::deserialize(deserializer).map(String::from)
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<StringOrNumber>::deserialize(deserializer).map(|v| v.map(String::from))
}
