//! Document store capability traits
//!
//! The queue, the result recorder and the session tracker are built on these
//! narrow traits. Any backend that provides insert-with-uniqueness, an atomic
//! ordered claim, count, point lookup and point delete can host a run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventSummary;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An event with this id already exists
    #[error("duplicate key: {0}")]
    DuplicateKey(Uuid),

    /// Record not found
    #[error("not found: {0}")]
    NotFound(Uuid),

    /// Transient payloads cannot be pinned to another driver
    #[error("event {0} carries in-memory data and cannot be assigned to a driver")]
    TransientAffinity(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether this is the expected duplicate-id condition
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }
}

/// Stored form of an event
///
/// Only JSON payloads can be stored. A transient payload is replaced by the
/// id of the process holding it (`data_owner`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDocument {
    pub id: Uuid,
    pub name: String,
    pub scheduled_at: DateTime<Utc>,
    pub data: serde_json::Value,
    pub data_owner: Option<String>,
    pub driver_id: Option<String>,
    pub session_id: Option<Uuid>,
    pub lock_owner: Option<String>,
    pub lock_time: Option<DateTime<Utc>>,
}

/// Which driver assignments a claim may take
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affinity {
    /// Only events pinned to this driver
    Driver(String),

    /// Unassigned events, plus pinned events scheduled at or before
    /// `stale_before` (their owner has not picked them up in time)
    Unassigned {
        stale_before: Option<DateTime<Utc>>,
    },
}

/// Predicate for an atomic claim
#[derive(Debug, Clone)]
pub struct ClaimFilter {
    /// Only events scheduled at or before this instant
    pub as_of: DateTime<Utc>,

    /// Recorded as the lock owner of the claimed event
    pub claimant: String,

    /// This process; events holding another process's data are skipped
    pub data_owner: String,

    /// Driver assignment rule
    pub affinity: Affinity,

    /// Claims locked at or before this instant count as expired.
    /// `None` means a claim never expires.
    pub lock_expiry: Option<DateTime<Utc>>,
}

impl ClaimFilter {
    /// Evaluate the claim predicate against a document
    pub fn matches(&self, doc: &EventDocument) -> bool {
        if doc.scheduled_at > self.as_of {
            return false;
        }

        let unlocked = match (&doc.lock_time, self.lock_expiry) {
            (None, _) => true,
            (Some(locked_at), Some(expiry)) => *locked_at <= expiry,
            (Some(_), None) => false,
        };
        if !unlocked {
            return false;
        }

        if let Some(owner) = &doc.data_owner {
            if *owner != self.data_owner {
                return false;
            }
        }

        match (&self.affinity, &doc.driver_id) {
            (Affinity::Driver(id), Some(driver)) => id == driver,
            (Affinity::Driver(_), None) => false,
            (Affinity::Unassigned { .. }, None) => true,
            (Affinity::Unassigned { stale_before }, Some(_)) => {
                stale_before.is_some_and(|cutoff| doc.scheduled_at <= cutoff)
            }
        }
    }
}

/// Storage for pending events
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Insert a new event; fails with `DuplicateKey` if the id exists
    async fn insert_event(&self, doc: EventDocument) -> Result<(), StoreError>;

    /// Atomically claim the earliest matching event
    ///
    /// Candidates are ordered by `(scheduled_at, id)`. The claimed document is
    /// marked with `claimant` and `as_of` as its lock and stays counted until
    /// deleted. Concurrent callers never receive the same event.
    async fn claim_event(&self, filter: &ClaimFilter) -> Result<Option<EventDocument>, StoreError>;

    /// Number of events not yet deleted, claimed or not
    async fn count_events(&self) -> Result<u64, StoreError>;

    /// Point lookup
    async fn get_event(&self, id: Uuid) -> Result<Option<EventDocument>, StoreError>;

    /// Point delete; returns whether the event existed
    async fn delete_event(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Unclaimed events in claim order
    async fn list_events(&self, skip: u64, limit: u64) -> Result<Vec<EventDocument>, StoreError>;

    /// Remove every event
    async fn clear_events(&self) -> Result<(), StoreError>;
}

/// One recorded outcome of a processed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub driver_id: String,
    pub event: EventSummary,
    pub success: bool,
    pub start_time: DateTime<Utc>,
    /// Billable processing time
    pub duration_ms: u64,
    pub message: serde_json::Value,
    /// Whether the record should appear in charts
    pub chart: bool,
    pub processed_by: String,
    pub warning: Option<String>,
    /// Names of the follow-up events actually published
    pub next_events: Vec<String>,
}

/// Append-only result log with its query surface
#[async_trait]
pub trait ResultStore: Send + Sync + 'static {
    /// Append a record
    async fn record_result(&self, record: EventRecord) -> Result<(), StoreError>;

    /// Earliest record by start time
    async fn first_result(&self) -> Result<Option<EventRecord>, StoreError>;

    /// Latest record by start time
    async fn last_result(&self) -> Result<Option<EventRecord>, StoreError>;

    /// Records for one event name, oldest first
    async fn results_by_event_name(
        &self,
        event_name: &str,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Records started in `[start, end)`, oldest first
    async fn results_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        chart_only: bool,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Distinct event names with results, sorted
    async fn event_names(&self) -> Result<Vec<String>, StoreError>;

    async fn count_results(&self) -> Result<u64, StoreError>;

    async fn count_results_by_event_name(&self, event_name: &str) -> Result<u64, StoreError>;

    async fn count_successes(&self) -> Result<u64, StoreError>;

    async fn count_failures(&self) -> Result<u64, StoreError>;
}

/// Session bookkeeping errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Session not found
    #[error("session not found: {0}")]
    NotFound(Uuid),

    /// Session end time was already recorded
    #[error("session already ended: {0}")]
    AlreadyEnded(Uuid),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A chain of events sharing a session id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    /// `None` while the session is open
    pub ended_at: Option<DateTime<Utc>>,
    pub data: Option<serde_json::Value>,
}

impl Session {
    /// Whether the end time has been recorded
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Time between start and end; `None` while open
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

/// Session tracker
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Open a session and return its id
    async fn start_session(&self, data: Option<serde_json::Value>) -> Result<Uuid, SessionError>;

    /// Record the end time; the second call fails with `AlreadyEnded`
    async fn end_session(&self, id: Uuid) -> Result<DateTime<Utc>, SessionError>;

    async fn session(&self, id: Uuid) -> Result<Option<Session>, SessionError>;

    async fn set_session_data(
        &self,
        id: Uuid,
        data: serde_json::Value,
    ) -> Result<(), SessionError>;

    async fn active_sessions_count(&self) -> Result<u64, SessionError>;

    async fn completed_sessions_count(&self) -> Result<u64, SessionError>;
}
