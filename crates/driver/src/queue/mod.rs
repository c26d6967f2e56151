//! Event queue
//!
//! The queue turns [`Event`]s into storable documents and back. Transient
//! payloads never reach the store: they stay in a process-local table keyed by
//! event id, and the stored document names this process as the data owner so
//! no other process can claim the event.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::event::{Event, EventData, TransientData};
use crate::persistence::{Affinity, ClaimFilter, EventDocument, EventStore, StoreError};

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// How long an event pinned to a driver waits for that driver before any
    /// driver may claim it. `None` keeps pinned events pinned forever.
    #[serde(with = "option_duration_millis")]
    pub assigned_event_grace_period: Option<Duration>,

    /// How long a claim holds before the event becomes claimable again.
    /// `None` means claims never expire, so an event runs at most once.
    #[serde(with = "option_duration_millis")]
    pub lock_timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            assigned_event_grace_period: Some(Duration::from_millis(5000)),
            lock_timeout: None,
        }
    }
}

impl QueueConfig {
    /// Create a new queue configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the grace period for driver-pinned events
    pub fn with_assigned_event_grace_period(mut self, period: Option<Duration>) -> Self {
        self.assigned_event_grace_period = period;
        self
    }

    /// Set the claim timeout
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// Shared event queue with atomic claims
pub struct EventQueue {
    store: Arc<dyn EventStore>,
    config: QueueConfig,
    /// Identifies this process as the owner of transient payloads
    data_owner: String,
    transient: DashMap<Uuid, TransientData>,
}

impl EventQueue {
    /// Create a queue over a store
    pub fn new(store: Arc<dyn EventStore>, config: QueueConfig) -> Self {
        Self::with_data_owner(store, config, format!("process-{}", Uuid::now_v7()))
    }

    /// Create a queue with an explicit data owner id
    pub fn with_data_owner(
        store: Arc<dyn EventStore>,
        config: QueueConfig,
        data_owner: impl Into<String>,
    ) -> Self {
        Self {
            store,
            config,
            data_owner: data_owner.into(),
            transient: DashMap::new(),
        }
    }

    /// This process's data owner id
    pub fn data_owner(&self) -> &str {
        &self.data_owner
    }

    /// Queue configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Insert a new event
    ///
    /// Fails with [`StoreError::DuplicateKey`] if an event with the same id
    /// exists, and with [`StoreError::TransientAffinity`] for a transient
    /// event pinned to a driver.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_name = %event.name))]
    pub async fn put_event(&self, event: Event) -> Result<Uuid, StoreError> {
        let id = event.id;
        let (data, data_owner) = match event.data {
            EventData::Persisted(value) => (value, None),
            EventData::Transient(live) => {
                if event.driver_id.is_some() {
                    return Err(StoreError::TransientAffinity(id));
                }
                match self.transient.entry(id) {
                    Entry::Occupied(_) => return Err(StoreError::DuplicateKey(id)),
                    Entry::Vacant(slot) => {
                        slot.insert(live);
                    }
                }
                (serde_json::Value::Null, Some(self.data_owner.clone()))
            }
        };
        let holds_transient = data_owner.is_some();

        let doc = EventDocument {
            id,
            name: event.name,
            scheduled_at: event.scheduled_at,
            data,
            data_owner,
            driver_id: event.driver_id,
            session_id: event.session_id,
            lock_owner: None,
            lock_time: None,
        };

        if let Err(e) = self.store.insert_event(doc).await {
            if holds_transient {
                self.transient.remove(&id);
            }
            return Err(e);
        }

        trace!("Event queued");
        Ok(id)
    }

    /// Claim the next eligible event
    ///
    /// With `restrict_to_driver` only events pinned to `driver_id` qualify;
    /// otherwise unassigned events qualify, plus pinned events whose grace
    /// period has run out.
    pub async fn next_event(
        &self,
        driver_id: &str,
        as_of: DateTime<Utc>,
        restrict_to_driver: bool,
    ) -> Result<Option<Event>, StoreError> {
        let affinity = if restrict_to_driver {
            Affinity::Driver(driver_id.to_string())
        } else {
            Affinity::Unassigned {
                stale_before: self
                    .config
                    .assigned_event_grace_period
                    .and_then(|grace| chrono::Duration::from_std(grace).ok())
                    .map(|grace| as_of - grace),
            }
        };

        let filter = ClaimFilter {
            as_of,
            claimant: driver_id.to_string(),
            data_owner: self.data_owner.clone(),
            affinity,
            lock_expiry: self
                .config
                .lock_timeout
                .and_then(|timeout| chrono::Duration::from_std(timeout).ok())
                .map(|timeout| as_of - timeout),
        };

        let claimed = self.store.claim_event(&filter).await?;
        if let Some(doc) = &claimed {
            debug!(event_id = %doc.id, event_name = %doc.name, driver_id, "Claimed event");
        }
        Ok(claimed.map(|doc| self.to_event(doc)))
    }

    /// Events not yet deleted, including claimed ones still being processed
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.store.count_events().await
    }

    /// Look up an event by id
    pub async fn get_event(&self, id: Uuid) -> Result<Option<Event>, StoreError> {
        Ok(self
            .store
            .get_event(id)
            .await?
            .map(|doc| self.to_event(doc)))
    }

    /// Remove an event and any payload it holds in this process
    pub async fn delete_event(&self, event: &Event) -> Result<bool, StoreError> {
        let deleted = self.store.delete_event(event.id).await?;
        self.transient.remove(&event.id);
        Ok(deleted)
    }

    /// Unclaimed events in claim order
    pub async fn events(&self, skip: u64, limit: u64) -> Result<Vec<Event>, StoreError> {
        let docs = self.store.list_events(skip, limit).await?;
        Ok(docs.into_iter().map(|doc| self.to_event(doc)).collect())
    }

    /// Remove every event
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.clear_events().await?;
        self.transient.clear();
        Ok(())
    }

    fn to_event(&self, doc: EventDocument) -> Event {
        let live = match &doc.data_owner {
            Some(owner) if *owner == self.data_owner => {
                self.transient.get(&doc.id).map(|entry| entry.value().clone())
            }
            _ => None,
        };
        let data = match live {
            Some(live) => EventData::Transient(live),
            None => EventData::Persisted(doc.data),
        };

        Event {
            id: doc.id,
            name: doc.name,
            scheduled_at: doc.scheduled_at,
            data,
            driver_id: doc.driver_id,
            session_id: doc.session_id,
            lock_owner: doc.lock_owner,
            lock_time: doc.lock_time,
        }
    }
}

/// Serde support for optional Duration as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
