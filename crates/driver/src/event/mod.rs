//! Event model
//!
//! An event is a named unit of work scheduled for a point in time. Its payload
//! is either a persisted JSON value or a transient in-process object that is
//! never serialized.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the bootstrap event that begins every run
pub const EVENT_NAME_START: &str = "start";

/// Fixed id of the bootstrap event
///
/// Inserting the start event with this id makes the insert itself the
/// "only once across all drivers" guard.
pub const EVENT_ID_START: Uuid = Uuid::from_u128(1);

/// Opaque live payload that stays inside the process that created it
#[derive(Clone)]
pub struct TransientData(Arc<dyn Any + Send + Sync>);

impl TransientData {
    /// Wrap a live value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Wrap an existing shared value without copying it
    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self(value)
    }

    /// Borrow the payload as a concrete type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Shared handle to the payload
    pub fn as_arc(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.0
    }

    /// True if both handles point at the same live object
    pub fn ptr_eq(&self, other: &TransientData) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TransientData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransientData(..)")
    }
}

/// Event payload
#[derive(Debug, Clone)]
pub enum EventData {
    /// Serializable payload stored alongside the event
    Persisted(serde_json::Value),

    /// Live object reference, valid only in the inserting process
    Transient(TransientData),
}

impl EventData {
    /// Empty persisted payload
    pub fn none() -> Self {
        Self::Persisted(serde_json::Value::Null)
    }

    /// Persisted payload, if any
    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Persisted(serde_json::Value::Null) => None,
            Self::Persisted(value) => Some(value),
            Self::Transient(_) => None,
        }
    }

    /// Transient payload, if any
    pub fn as_transient(&self) -> Option<&TransientData> {
        match self {
            Self::Transient(data) => Some(data),
            Self::Persisted(_) => None,
        }
    }
}

impl Default for EventData {
    fn default() -> Self {
        Self::none()
    }
}

impl From<serde_json::Value> for EventData {
    fn from(value: serde_json::Value) -> Self {
        Self::Persisted(value)
    }
}

/// A schedulable unit of work
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique id; pre-assign it to make insertion idempotent
    pub id: Uuid,

    /// Selects the processor and producer
    pub name: String,

    /// Earliest instant the event may be claimed
    pub scheduled_at: DateTime<Utc>,

    /// Payload
    pub data: EventData,

    /// Driver affinity; `None` means any driver may claim it
    pub driver_id: Option<String>,

    /// Session correlation
    pub session_id: Option<Uuid>,

    /// Claim marker, set when the event was claimed
    pub lock_owner: Option<String>,

    /// Claim time, set when the event was claimed
    pub lock_time: Option<DateTime<Utc>>,
}

impl Event {
    /// Create an event with a fresh id
    pub fn new(
        name: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        data: impl Into<EventData>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            scheduled_at,
            data: data.into(),
            driver_id: None,
            session_id: None,
            lock_owner: None,
            lock_time: None,
        }
    }

    /// Create an event carrying a live in-process payload
    pub fn with_transient<T: Any + Send + Sync>(
        name: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        value: T,
    ) -> Self {
        Self::new(
            name,
            scheduled_at,
            EventData::Transient(TransientData::new(value)),
        )
    }

    /// The bootstrap event, with its fixed id
    pub fn start(scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: EVENT_ID_START,
            ..Self::new(EVENT_NAME_START, scheduled_at, EventData::none())
        }
    }

    /// Replace the id
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Pin the event to a driver
    pub fn with_driver(mut self, driver_id: impl Into<String>) -> Self {
        self.driver_id = Some(driver_id.into());
        self
    }

    /// Attach a session
    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Whether the payload lives only in this process
    pub fn data_in_memory(&self) -> bool {
        matches!(self.data, EventData::Transient(_))
    }
}

/// Summary of an event as stored in result records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: Uuid,
    pub name: String,
    pub scheduled_at: DateTime<Utc>,
    pub session_id: Option<Uuid>,
    /// Persisted payload; transient payloads are recorded as null
    pub data: serde_json::Value,
}

impl From<&Event> for EventSummary {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id,
            name: event.name.clone(),
            scheduled_at: event.scheduled_at,
            session_id: event.session_id,
            data: event.data.as_value().cloned().unwrap_or_default(),
        }
    }
}
