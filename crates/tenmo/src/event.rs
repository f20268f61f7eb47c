//! Event envelope: the append-only records producers submit.
//!
//! Events are immutable facts. Each stored event additionally carries queue
//! bookkeeping ([`EventStatus`], attempt counter, last modification time) that
//! the store owns; producers never set it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique, sortable event identifier.
///
/// Used as the queue primary key and as the default `operation_id` /
/// `message_id` when the producer does not supply one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Wrap a producer-supplied identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh time-ordered identifier (UUIDv7).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Kind of access an execution performed on an incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    #[serde(alias = "r")]
    Read,
    #[serde(alias = "w")]
    Write,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" | "r" => Ok(Self::Read),
            "write" | "w" => Ok(Self::Write),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

/// An execution started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionBegins {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An execution finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnds {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub execution_id: String,
}

/// An execution read or wrote an incarnation of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationObserved {
    pub event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub execution_id: String,
    #[serde(alias = "type")]
    pub op_type: OpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub incarnation_id: String,
    /// Prior incarnation this one derives from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_incarnation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incarnation_description: Option<String>,
}

impl OperationObserved {
    /// The operation id, falling back to the event id.
    pub fn operation_id(&self) -> String {
        self.operation_id
            .clone()
            .unwrap_or_else(|| self.event_id.to_string())
    }
}

/// A participant sent a message within an interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSent {
    pub event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub interaction_id: String,
    pub sender: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, alias = "incarnations_ids", skip_serializing_if = "Option::is_none")]
    pub incarnation_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_description: Option<String>,
}

impl MessageSent {
    /// The message id, falling back to the event id.
    pub fn message_id(&self) -> String {
        self.message_id
            .clone()
            .unwrap_or_else(|| self.event_id.to_string())
    }
}

/// One occurrence in the lifecycle of a distributed computation.
///
/// Serialized with an `event_type` tag so a stored payload decodes back into
/// exactly one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum Event {
    ExecutionBegins(ExecutionBegins),
    ExecutionEnds(ExecutionEnds),
    Operation(OperationObserved),
    Message(MessageSent),
}

impl Event {
    pub fn id(&self) -> &EventId {
        match self {
            Self::ExecutionBegins(e) => &e.event_id,
            Self::ExecutionEnds(e) => &e.event_id,
            Self::Operation(e) => &e.event_id,
            Self::Message(e) => &e.event_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ExecutionBegins(e) => e.timestamp,
            Self::ExecutionEnds(e) => e.timestamp,
            Self::Operation(e) => e.timestamp,
            Self::Message(e) => e.timestamp,
        }
    }

    /// The `event_type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExecutionBegins(_) => "ExecutionBegins",
            Self::ExecutionEnds(_) => "ExecutionEnds",
            Self::Operation(_) => "Operation",
            Self::Message(_) => "Message",
        }
    }
}

/// Queue lifecycle of a stored event.
///
/// Transitions: `idle -> claimed -> {processed, idle, abandoned}`.
/// `abandoned` marks an event that exhausted its attempts (or could not be
/// decoded) and will never be claimed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Idle,
    Claimed,
    Processed,
    Abandoned,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Claimed => "claimed",
            Self::Processed => "processed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Abandoned)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "claimed" => Ok(Self::Claimed),
            "processed" => Ok(Self::Processed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

/// A string that does not name any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value: {0}")]
pub struct UnknownValue(pub String);

/// An event as held by the store, with its queue bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub event: Event,
    pub status: EventStatus,
    pub attempts: u32,
    pub last_modified: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// An event handed to a worker by [`EventStore::claim_one`](crate::EventStore::claim_one).
///
/// `attempts` is the counter value after this claim; it fences later
/// `release` / `mark_processed` calls so they only act on this claim.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedEvent {
    pub event: Event,
    pub attempts: u32,
}

impl ClaimedEvent {
    pub fn id(&self) -> &EventId {
        self.event.id()
    }
}
