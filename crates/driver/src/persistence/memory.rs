//! In-memory implementation of the store traits for testing and single-process runs

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

/// Pending events indexed in claim order
#[derive(Default)]
struct EventTable {
    docs: HashMap<Uuid, EventDocument>,
    /// Unclaimed events ordered by `(scheduled_at, id)`
    pending: BTreeSet<(DateTime<Utc>, Uuid)>,
}

impl EventTable {
    fn first_pending(&self, filter: &ClaimFilter) -> Option<(DateTime<Utc>, Uuid)> {
        self.pending
            .iter()
            .take_while(|(scheduled_at, _)| *scheduled_at <= filter.as_of)
            .find(|(_, id)| self.docs.get(id).is_some_and(|doc| filter.matches(doc)))
            .copied()
    }

    fn first_expired(&self, filter: &ClaimFilter) -> Option<(DateTime<Utc>, Uuid)> {
        filter.lock_expiry?;
        self.docs
            .values()
            .filter(|doc| doc.lock_time.is_some() && filter.matches(doc))
            .map(|doc| (doc.scheduled_at, doc.id))
            .min()
    }
}

/// In-memory implementation of the event, result and session stores
///
/// Provides the same claim semantics as the PostgreSQL implementation within
/// a single process. All three traits are implemented on one value so a
/// test can share it as every backend.
///
/// # Example
///
/// ```
/// use benchrun_driver::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// ```
pub struct InMemoryStore {
    events: RwLock<EventTable>,
    results: RwLock<Vec<EventRecord>>,
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            events: RwLock::new(EventTable::default()),
            results: RwLock::new(Vec::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Number of events currently claimed and not yet deleted
    pub fn claimed_count(&self) -> usize {
        self.events
            .read()
            .docs
            .values()
            .filter(|doc| doc.lock_time.is_some())
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.events.write() = EventTable::default();
        self.results.write().clear();
        self.sessions.write().clear();
    }

    fn sorted_results<F>(&self, predicate: F, skip: u64, limit: u64) -> Vec<EventRecord>
    where
        F: Fn(&EventRecord) -> bool,
    {
        let results = self.results.read();
        let mut matching: Vec<EventRecord> =
            results.iter().filter(|r| predicate(r)).cloned().collect();
        matching.sort_by_key(|r| r.start_time);
        matching
            .into_iter()
            .skip(skip as usize)
            .take(limit as usize)
            .collect()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn insert_event(&self, doc: EventDocument) -> Result<(), StoreError> {
        let mut events = self.events.write();
        if events.docs.contains_key(&doc.id) {
            return Err(StoreError::DuplicateKey(doc.id));
        }
        if doc.lock_time.is_none() {
            events.pending.insert((doc.scheduled_at, doc.id));
        }
        events.docs.insert(doc.id, doc);
        Ok(())
    }

    async fn claim_event(&self, filter: &ClaimFilter) -> Result<Option<EventDocument>, StoreError> {
        let mut events = self.events.write();

        let candidate = match (events.first_pending(filter), events.first_expired(filter)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let Some(key) = candidate else {
            return Ok(None);
        };

        events.pending.remove(&key);
        let doc = events
            .docs
            .get_mut(&key.1)
            .ok_or(StoreError::NotFound(key.1))?;
        doc.lock_owner = Some(filter.claimant.clone());
        doc.lock_time = Some(filter.as_of);
        Ok(Some(doc.clone()))
    }

    async fn count_events(&self) -> Result<u64, StoreError> {
        Ok(self.events.read().docs.len() as u64)
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<EventDocument>, StoreError> {
        Ok(self.events.read().docs.get(&id).cloned())
    }

    async fn delete_event(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut events = self.events.write();
        match events.docs.remove(&id) {
            Some(doc) => {
                events.pending.remove(&(doc.scheduled_at, doc.id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_events(&self, skip: u64, limit: u64) -> Result<Vec<EventDocument>, StoreError> {
        let events = self.events.read();
        Ok(events
            .pending
            .iter()
            .skip(skip as usize)
            .take(limit as usize)
            .filter_map(|(_, id)| events.docs.get(id).cloned())
            .collect())
    }

    async fn clear_events(&self) -> Result<(), StoreError> {
        *self.events.write() = EventTable::default();
        Ok(())
    }
}

#[async_trait]
impl ResultStore for InMemoryStore {
    async fn record_result(&self, record: EventRecord) -> Result<(), StoreError> {
        self.results.write().push(record);
        Ok(())
    }

    async fn first_result(&self) -> Result<Option<EventRecord>, StoreError> {
        Ok(self
            .results
            .read()
            .iter()
            .min_by_key(|r| r.start_time)
            .cloned())
    }

    async fn last_result(&self) -> Result<Option<EventRecord>, StoreError> {
        Ok(self
            .results
            .read()
            .iter()
            .max_by_key(|r| r.start_time)
            .cloned())
    }

    async fn results_by_event_name(
        &self,
        event_name: &str,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self.sorted_results(|r| r.event.name == event_name, skip, limit))
    }

    async fn results_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        chart_only: bool,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self.sorted_results(
            |r| r.start_time >= start && r.start_time < end && (!chart_only || r.chart),
            skip,
            limit,
        ))
    }

    async fn event_names(&self) -> Result<Vec<String>, StoreError> {
        let results = self.results.read();
        let names: BTreeSet<String> = results.iter().map(|r| r.event.name.clone()).collect();
        Ok(names.into_iter().collect())
    }

    async fn count_results(&self) -> Result<u64, StoreError> {
        Ok(self.results.read().len() as u64)
    }

    async fn count_results_by_event_name(&self, event_name: &str) -> Result<u64, StoreError> {
        Ok(self
            .results
            .read()
            .iter()
            .filter(|r| r.event.name == event_name)
            .count() as u64)
    }

    async fn count_successes(&self) -> Result<u64, StoreError> {
        Ok(self.results.read().iter().filter(|r| r.success).count() as u64)
    }

    async fn count_failures(&self) -> Result<u64, StoreError> {
        Ok(self.results.read().iter().filter(|r| !r.success).count() as u64)
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn start_session(&self, data: Option<serde_json::Value>) -> Result<Uuid, SessionError> {
        let session = Session {
            id: Uuid::now_v7(),
            started_at: Utc::now(),
            ended_at: None,
            data,
        };
        let id = session.id;
        self.sessions.write().insert(id, session);
        Ok(id)
    }

    async fn end_session(&self, id: Uuid) -> Result<DateTime<Utc>, SessionError> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        if session.ended_at.is_some() {
            return Err(SessionError::AlreadyEnded(id));
        }
        let ended_at = Utc::now().max(session.started_at);
        session.ended_at = Some(ended_at);
        Ok(ended_at)
    }

    async fn session(&self, id: Uuid) -> Result<Option<Session>, SessionError> {
        Ok(self.sessions.read().get(&id).cloned())
    }

    async fn set_session_data(
        &self,
        id: Uuid,
        data: serde_json::Value,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        session.data = Some(data);
        Ok(())
    }

    async fn active_sessions_count(&self) -> Result<u64, SessionError> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| !s.is_ended())
            .count() as u64)
    }

    async fn completed_sessions_count(&self) -> Result<u64, SessionError> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| s.is_ended())
            .count() as u64)
    }
}
