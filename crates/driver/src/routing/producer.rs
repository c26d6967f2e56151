//! Event producers
//!
//! A producer rewrites a proposed follow-up event before it is queued:
//! rename it, delay it, pick a random target, or drop it. Producers are keyed
//! by event name, so chains can be rewired without touching processors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::selector::{EventWeight, RandomWeightedSelector};
use crate::event::Event;

/// Routing errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoutingError {
    /// A producer is already registered for this name
    #[error("producer already registered for event: {0}")]
    DuplicateProducer(String),

    /// Producers route an event back to a name already on its path
    #[error("producer cycle detected: {0}")]
    Cycle(String),
}

/// Maps one event to zero or more events
pub trait EventProducer: Send + Sync + 'static {
    /// Rewrite `event`; must not have side effects
    fn next_events(&self, event: Event, now: DateTime<Utc>) -> Vec<Event>;
}

/// Absorbs every event, ending the chain
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminateProducer;

impl EventProducer for TerminateProducer {
    fn next_events(&self, _event: Event, _now: DateTime<Utc>) -> Vec<Event> {
        Vec::new()
    }
}

/// Renames an event and optionally pushes it later
///
/// The new schedule is `max(now + delay, scheduled_at)`; an event is never
/// moved earlier than it already was.
#[derive(Debug, Clone)]
pub struct RedirectProducer {
    new_event_name: String,
    delay: Duration,
}

impl RedirectProducer {
    pub fn new(new_event_name: impl Into<String>) -> Self {
        Self {
            new_event_name: new_event_name.into(),
            delay: Duration::ZERO,
        }
    }

    /// Delay the redirected event
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn new_event_name(&self) -> &str {
        &self.new_event_name
    }
}

fn redirect(mut event: Event, name: &str, delay: Duration, now: DateTime<Utc>) -> Event {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    event.name = name.to_string();
    event.scheduled_at = (now + delay).max(event.scheduled_at);
    event
}

impl EventProducer for RedirectProducer {
    fn next_events(&self, event: Event, now: DateTime<Utc>) -> Vec<Event> {
        vec![redirect(event, &self.new_event_name, self.delay, now)]
    }
}

/// Redirects each event to one randomly chosen target
#[derive(Debug, Clone)]
pub struct RandomRedirectProducer {
    selector: RandomWeightedSelector<EventWeight>,
}

impl RandomRedirectProducer {
    pub fn new(targets: impl IntoIterator<Item = EventWeight>) -> Self {
        Self {
            selector: RandomWeightedSelector::new(targets.into_iter().map(|t| (t.weight, t))),
        }
    }
}

impl EventProducer for RandomRedirectProducer {
    fn next_events(&self, event: Event, now: DateTime<Utc>) -> Vec<Event> {
        let mut rng = rand::thread_rng();
        match self.selector.select_with(&mut rng) {
            Some(target) => {
                let delay = target.delay.sample(&mut rng);
                vec![redirect(event, &target.event_name, delay, now)]
            }
            None => Vec::new(),
        }
    }
}

/// Producers keyed by event name
///
/// Populate it during setup, then share it behind an `Arc`; lookups need
/// no locking.
#[derive(Default)]
pub struct EventProducerRegistry {
    producers: HashMap<String, Arc<dyn EventProducer>>,
}

impl EventProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a producer for an event name
    pub fn register(
        &mut self,
        event_name: impl Into<String>,
        producer: impl EventProducer,
    ) -> Result<(), RoutingError> {
        let event_name = event_name.into();
        if self.producers.contains_key(&event_name) {
            return Err(RoutingError::DuplicateProducer(event_name));
        }
        self.producers.insert(event_name, Arc::new(producer));
        Ok(())
    }

    pub fn get(&self, event_name: &str) -> Option<&Arc<dyn EventProducer>> {
        self.producers.get(event_name)
    }

    pub fn contains(&self, event_name: &str) -> bool {
        self.producers.contains_key(event_name)
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Run an event through its producer, and the output through theirs,
    /// until every branch reaches a name with no producer
    pub fn resolve(&self, event: Event, now: DateTime<Utc>) -> Result<Vec<Event>, RoutingError> {
        let mut resolved = Vec::new();
        self.resolve_branch(event, now, &mut Vec::new(), &mut resolved)?;
        Ok(resolved)
    }

    fn resolve_branch(
        &self,
        event: Event,
        now: DateTime<Utc>,
        path: &mut Vec<String>,
        resolved: &mut Vec<Event>,
    ) -> Result<(), RoutingError> {
        let Some(producer) = self.producers.get(&event.name) else {
            resolved.push(event);
            return Ok(());
        };

        if path.contains(&event.name) {
            path.push(event.name);
            return Err(RoutingError::Cycle(path.join(" -> ")));
        }

        path.push(event.name.clone());
        for next in producer.next_events(event, now) {
            self.resolve_branch(next, now, path, resolved)?;
        }
        path.pop();
        Ok(())
    }
}

impl std::fmt::Debug for EventProducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProducerRegistry")
            .field("event_names", &self.producers.keys().collect::<Vec<_>>())
            .finish()
    }
}
