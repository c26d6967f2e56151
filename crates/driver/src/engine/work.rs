//! Work unit: executes one claimed event and publishes its effects

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::processor::{EventProcessor, EventResult};
use super::stopwatch::StopWatch;
use crate::event::{Event, EventSummary};
use crate::persistence::{EventRecord, ResultStore, SessionError, SessionStore, StoreError};
use crate::queue::EventQueue;
use crate::routing::{EventProducerRegistry, RandomWeightedSelector};

const MSG_PROCESSING_EXCEPTION: &str =
    "Event processing exception; no further events will be published";

/// Everything a work unit needs besides its event and processor
pub struct WorkContext {
    /// Recorded on every result
    pub driver_id: String,
    pub queue: Arc<EventQueue>,
    pub results: Arc<dyn ResultStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub producers: Arc<EventProducerRegistry>,
    /// Spreads persisted follow-ups across drivers when set
    pub driver_selector: Option<RandomWeightedSelector<String>>,
}

impl WorkContext {
    pub fn new(
        driver_id: impl Into<String>,
        queue: Arc<EventQueue>,
        results: Arc<dyn ResultStore>,
        sessions: Arc<dyn SessionStore>,
        producers: Arc<EventProducerRegistry>,
    ) -> Self {
        Self {
            driver_id: driver_id.into(),
            queue,
            results,
            sessions,
            producers,
            driver_selector: None,
        }
    }

    /// Pin follow-up events to one of these drivers, chosen at random
    pub fn with_driver_ids(mut self, driver_ids: &[String]) -> Self {
        self.driver_selector = if driver_ids.is_empty() {
            None
        } else {
            Some(RandomWeightedSelector::new(
                driver_ids.iter().map(|id| (1.0, id.clone())),
            ))
        };
        self
    }
}

/// Processes exactly one event and records exactly one result for it
pub struct EventWork {
    context: Arc<WorkContext>,
    event: Event,
    processor: Arc<dyn EventProcessor>,
}

impl EventWork {
    pub fn new(context: Arc<WorkContext>, event: Event, processor: Arc<dyn EventProcessor>) -> Self {
        Self {
            context,
            event,
            processor,
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Run the processor, publish follow-ups, record the result and remove
    /// the event from the queue
    ///
    /// Processor errors and panics become failed results. Storage errors end
    /// the unit and are returned. The event is removed on every path, since
    /// its claim is spent and a leftover would hold the queue count above zero.
    #[instrument(
        skip(self),
        fields(
            event_id = %self.event.id,
            event_name = %self.event.name,
            processor = %self.processor.name()
        )
    )]
    pub async fn run(self) -> Result<EventRecord, StoreError> {
        let outcome = self.execute().await;

        let deleted = self
            .context
            .queue
            .delete_event(&self.event)
            .await
            .inspect_err(|e| error!(error = %e, "Failed to delete processed event"));

        let record = outcome?;
        deleted?;
        debug!(
            success = record.success,
            duration_ms = record.duration_ms,
            "Event processed"
        );
        Ok(record)
    }

    async fn execute(&self) -> Result<EventRecord, StoreError> {
        let start_time = Utc::now();
        let options = self.processor.options();

        let mut timer = StopWatch::started();
        let outcome = AssertUnwindSafe(self.processor.process_event(&self.event, &mut timer))
            .catch_unwind()
            .await;
        timer.stop();
        let elapsed = timer.elapsed();

        let EventResult {
            mut message,
            mut success,
            next_events: proposed,
        } = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(error = %e, "Event processing failed");
                EventResult::failure(json!({
                    "error": e.to_string(),
                    "message": MSG_PROCESSING_EXCEPTION,
                }))
            }
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                error!(panic = %detail, "Event processor panicked");
                EventResult::failure(json!({
                    "error": detail,
                    "message": MSG_PROCESSING_EXCEPTION,
                }))
            }
        };

        // Route proposals through producers
        let now = Utc::now();
        let mut next_events = Vec::with_capacity(proposed.len());
        for event in proposed {
            match self.context.producers.resolve(event, now) {
                Ok(resolved) => next_events.extend(resolved),
                Err(e) => {
                    error!(error = %e, "Follow-up routing failed; publishing nothing");
                    next_events.clear();
                    success = false;
                    message = json!({ "error": e.to_string(), "message": message });
                    break;
                }
            }
        }

        let mut ended_session = None;
        if let Some(session_id) = self.event.session_id {
            if options.auto_propagate_session {
                for next in next_events.iter_mut().filter(|e| e.session_id.is_none()) {
                    next.session_id = Some(session_id);
                }
            }
            let carried = next_events.iter().any(|e| e.session_id == Some(session_id));
            if options.auto_close_session && !carried {
                ended_session = Some(session_id);
            }
        }

        if let Some(selector) = &self.context.driver_selector {
            for next in next_events
                .iter_mut()
                .filter(|e| e.driver_id.is_none() && !e.data_in_memory())
            {
                next.driver_id = selector.select().cloned();
            }
        }

        // Publish before recording so a recorded result implies queued follow-ups
        let mut published = Vec::with_capacity(next_events.len());
        for next in next_events {
            let name = next.name.clone();
            match self.context.queue.put_event(next).await {
                Ok(_) => published.push(name),
                Err(e) if e.is_duplicate_key() => {
                    debug!(next_event = %name, "Follow-up already queued");
                }
                Err(e) => {
                    error!(error = %e, next_event = %name, "Failed to publish follow-up event");
                    return Err(e);
                }
            }
        }

        let warning = options
            .warn_delay
            .filter(|limit| elapsed > *limit)
            .map(|limit| {
                let warning = format!(
                    "Event processing took {}ms, exceeding the {}ms warning threshold",
                    elapsed.as_millis(),
                    limit.as_millis()
                );
                warn!(elapsed_ms = elapsed.as_millis() as u64, "{}", warning);
                warning
            });

        let record = EventRecord {
            id: Uuid::now_v7(),
            driver_id: self.context.driver_id.clone(),
            event: EventSummary::from(&self.event),
            success,
            start_time,
            duration_ms: elapsed.as_millis() as u64,
            message,
            chart: options.chart,
            processed_by: self.processor.name().to_string(),
            warning,
            next_events: published,
        };

        self.context
            .results
            .record_result(record.clone())
            .await
            .inspect_err(|e| error!(error = %e, "Failed to record result"))?;

        // Only a chain whose result made it to the store ends its session
        if let Some(session_id) = ended_session {
            self.close_session(session_id).await;
        }

        Ok(record)
    }

    async fn close_session(&self, session_id: Uuid) {
        match self.context.sessions.end_session(session_id).await {
            Ok(_) => debug!(%session_id, "Session closed"),
            Err(SessionError::AlreadyEnded(_)) => {
                debug!(%session_id, "Session already closed");
            }
            Err(e) => warn!(%session_id, error = %e, "Failed to close session"),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "processor panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ProcessorError, ProcessorOptions};
    use crate::event::EventData;
    use crate::persistence::InMemoryStore;
    use crate::queue::QueueConfig;
    use crate::routing::{RedirectProducer, TerminateProducer};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Emits the configured follow-ups
    struct Emit {
        names: Vec<&'static str>,
        options: ProcessorOptions,
    }

    #[async_trait]
    impl EventProcessor for Emit {
        fn name(&self) -> &str {
            "emit"
        }

        fn options(&self) -> ProcessorOptions {
            self.options.clone()
        }

        async fn process_event(
            &self,
            _event: &Event,
            _timer: &mut StopWatch,
        ) -> Result<EventResult, ProcessorError> {
            let now = Utc::now();
            Ok(EventResult::success("emitted").with_next_events(
                self.names
                    .iter()
                    .map(|name| Event::new(*name, now, EventData::none())),
            ))
        }
    }

    struct Failing;

    #[async_trait]
    impl EventProcessor for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn process_event(
            &self,
            _event: &Event,
            _timer: &mut StopWatch,
        ) -> Result<EventResult, ProcessorError> {
            Err(ProcessorError::failed("backend unavailable"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventProcessor for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn process_event(
            &self,
            _event: &Event,
            _timer: &mut StopWatch,
        ) -> Result<EventResult, ProcessorError> {
            panic!("boom");
        }
    }

    /// Sleeps with the timer suspended, then briefly with it running
    struct Waiting;

    #[async_trait]
    impl EventProcessor for Waiting {
        fn name(&self) -> &str {
            "waiting"
        }

        fn options(&self) -> ProcessorOptions {
            ProcessorOptions::default().with_warn_delay(Duration::from_millis(1))
        }

        async fn process_event(
            &self,
            _event: &Event,
            timer: &mut StopWatch,
        ) -> Result<EventResult, ProcessorError> {
            timer.suspend();
            tokio::time::sleep(Duration::from_millis(100)).await;
            timer.resume();
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(EventResult::success("waited"))
        }
    }

    /// Result store whose writes fail
    struct BrokenResults(Arc<InMemoryStore>);

    #[async_trait]
    impl ResultStore for BrokenResults {
        async fn record_result(&self, _record: EventRecord) -> Result<(), StoreError> {
            Err(StoreError::Database("connection reset".to_string()))
        }

        async fn first_result(&self) -> Result<Option<EventRecord>, StoreError> {
            self.0.first_result().await
        }

        async fn last_result(&self) -> Result<Option<EventRecord>, StoreError> {
            self.0.last_result().await
        }

        async fn results_by_event_name(
            &self,
            event_name: &str,
            skip: u64,
            limit: u64,
        ) -> Result<Vec<EventRecord>, StoreError> {
            self.0.results_by_event_name(event_name, skip, limit).await
        }

        async fn results_in_window(
            &self,
            start: chrono::DateTime<Utc>,
            end: chrono::DateTime<Utc>,
            chart_only: bool,
            skip: u64,
            limit: u64,
        ) -> Result<Vec<EventRecord>, StoreError> {
            self.0
                .results_in_window(start, end, chart_only, skip, limit)
                .await
        }

        async fn event_names(&self) -> Result<Vec<String>, StoreError> {
            self.0.event_names().await
        }

        async fn count_results(&self) -> Result<u64, StoreError> {
            self.0.count_results().await
        }

        async fn count_results_by_event_name(&self, event_name: &str) -> Result<u64, StoreError> {
            self.0.count_results_by_event_name(event_name).await
        }

        async fn count_successes(&self) -> Result<u64, StoreError> {
            self.0.count_successes().await
        }

        async fn count_failures(&self) -> Result<u64, StoreError> {
            self.0.count_failures().await
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        context: Arc<WorkContext>,
    }

    fn harness(producers: EventProducerRegistry) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(EventQueue::new(store.clone(), QueueConfig::default()));
        let context = Arc::new(WorkContext::new(
            "driver-1",
            queue,
            store.clone(),
            store.clone(),
            Arc::new(producers),
        ));
        Harness { store, context }
    }

    async fn claim(harness: &Harness, event: Event) -> Event {
        harness.context.queue.put_event(event).await.unwrap();
        harness
            .context
            .queue
            .next_event("driver-1", Utc::now(), false)
            .await
            .unwrap()
            .unwrap()
    }

    fn emit(names: Vec<&'static str>) -> Arc<dyn EventProcessor> {
        Arc::new(Emit {
            names,
            options: ProcessorOptions::default(),
        })
    }

    #[tokio::test]
    async fn test_success_publishes_records_and_deletes() {
        let h = harness(EventProducerRegistry::new());
        let event = claim(&h, Event::new("go", Utc::now(), EventData::none())).await;

        let record = EventWork::new(h.context.clone(), event.clone(), emit(vec!["a", "b"]))
            .run()
            .await
            .unwrap();

        assert!(record.success);
        assert_eq!(record.next_events, vec!["a", "b"]);
        assert_eq!(record.processed_by, "emit");
        assert_eq!(record.driver_id, "driver-1");
        assert!(h.context.queue.get_event(event.id).await.unwrap().is_none());
        assert_eq!(h.context.queue.count().await.unwrap(), 2);
        assert_eq!(h.store.count_results().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_processor_error_becomes_failure() {
        let h = harness(EventProducerRegistry::new());
        let event = claim(&h, Event::new("go", Utc::now(), EventData::none())).await;

        let record = EventWork::new(h.context.clone(), event, Arc::new(Failing))
            .run()
            .await
            .unwrap();

        assert!(!record.success);
        assert_eq!(record.message["error"], json!("backend unavailable"));
        assert_eq!(record.message["message"], json!(MSG_PROCESSING_EXCEPTION));
        assert_eq!(h.store.count_failures().await.unwrap(), 1);
        assert_eq!(h.context.queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let h = harness(EventProducerRegistry::new());
        let event = claim(&h, Event::new("go", Utc::now(), EventData::none())).await;

        let record = EventWork::new(h.context.clone(), event, Arc::new(Panicking))
            .run()
            .await
            .unwrap();

        assert!(!record.success);
        assert_eq!(record.message["error"], json!("boom"));
    }

    #[tokio::test]
    async fn test_producers_rewrite_follow_ups() {
        let mut producers = EventProducerRegistry::new();
        producers.register("a", RedirectProducer::new("renamed")).unwrap();
        producers.register("b", TerminateProducer).unwrap();
        let h = harness(producers);
        let event = claim(&h, Event::new("go", Utc::now(), EventData::none())).await;

        let record = EventWork::new(h.context.clone(), event, emit(vec!["a", "b", "c"]))
            .run()
            .await
            .unwrap();

        assert_eq!(record.next_events, vec!["renamed", "c"]);
        assert_eq!(h.context.queue.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_producer_cycle_records_failure() {
        let mut producers = EventProducerRegistry::new();
        producers.register("a", RedirectProducer::new("b")).unwrap();
        producers.register("b", RedirectProducer::new("a")).unwrap();
        let h = harness(producers);
        let event = claim(&h, Event::new("go", Utc::now(), EventData::none())).await;

        let record = EventWork::new(h.context.clone(), event, emit(vec!["a"]))
            .run()
            .await
            .unwrap();

        assert!(!record.success);
        assert!(record.next_events.is_empty());
        assert_eq!(h.context.queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_session_propagates_to_follow_ups() {
        let h = harness(EventProducerRegistry::new());
        let session_id = h.store.start_session(None).await.unwrap();
        let event = claim(
            &h,
            Event::new("go", Utc::now(), EventData::none()).with_session(session_id),
        )
        .await;

        EventWork::new(h.context.clone(), event, emit(vec!["a", "b"]))
            .run()
            .await
            .unwrap();

        let queued = h.context.queue.events(0, 10).await.unwrap();
        assert!(queued.iter().all(|e| e.session_id == Some(session_id)));
        let session = h.store.session(session_id).await.unwrap().unwrap();
        assert!(!session.is_ended());
    }

    #[tokio::test]
    async fn test_session_closes_when_chain_ends() {
        let h = harness(EventProducerRegistry::new());
        let session_id = h.store.start_session(None).await.unwrap();
        let event = claim(
            &h,
            Event::new("go", Utc::now(), EventData::none()).with_session(session_id),
        )
        .await;

        EventWork::new(h.context.clone(), event, emit(vec![]))
            .run()
            .await
            .unwrap();

        let session = h.store.session(session_id).await.unwrap().unwrap();
        assert!(session.is_ended());
    }

    #[tokio::test]
    async fn test_session_left_open_without_auto_close() {
        let h = harness(EventProducerRegistry::new());
        let session_id = h.store.start_session(None).await.unwrap();
        let event = claim(
            &h,
            Event::new("go", Utc::now(), EventData::none()).with_session(session_id),
        )
        .await;

        let processor = Arc::new(Emit {
            names: vec![],
            options: ProcessorOptions::default().with_auto_close_session(false),
        });
        EventWork::new(h.context.clone(), event, processor)
            .run()
            .await
            .unwrap();

        let session = h.store.session(session_id).await.unwrap().unwrap();
        assert!(!session.is_ended());
    }

    #[tokio::test]
    async fn test_suspended_time_not_billed_and_warning_recorded() {
        let h = harness(EventProducerRegistry::new());
        let event = claim(&h, Event::new("go", Utc::now(), EventData::none())).await;

        let record = EventWork::new(h.context.clone(), event, Arc::new(Waiting))
            .run()
            .await
            .unwrap();

        assert!(record.duration_ms >= 10);
        assert!(record.duration_ms < 100);
        assert!(record.warning.is_some());
    }

    #[tokio::test]
    async fn test_storage_failure_still_removes_event() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(EventQueue::new(store.clone(), QueueConfig::default()));
        let context = Arc::new(WorkContext::new(
            "driver-1",
            queue.clone(),
            Arc::new(BrokenResults(store.clone())),
            store.clone(),
            Arc::new(EventProducerRegistry::new()),
        ));
        let session_id = store.start_session(None).await.unwrap();
        queue
            .put_event(Event::new("go", Utc::now(), EventData::none()).with_session(session_id))
            .await
            .unwrap();
        let event = queue
            .next_event("driver-1", Utc::now(), false)
            .await
            .unwrap()
            .unwrap();

        let err = EventWork::new(context, event.clone(), emit(vec![]))
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Database(_)));
        assert!(queue.get_event(event.id).await.unwrap().is_none());
        assert_eq!(queue.count().await.unwrap(), 0);
        // The chain's result never landed, so its session stays open
        let session = store.session(session_id).await.unwrap().unwrap();
        assert!(!session.is_ended());
    }

    #[tokio::test]
    async fn test_follow_ups_assigned_to_drivers() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(EventQueue::new(store.clone(), QueueConfig::default()));
        let context = Arc::new(
            WorkContext::new(
                "driver-1",
                queue.clone(),
                store.clone(),
                store.clone(),
                Arc::new(EventProducerRegistry::new()),
            )
            .with_driver_ids(&["d-a".to_string(), "d-b".to_string()]),
        );

        queue
            .put_event(Event::new("go", Utc::now(), EventData::none()))
            .await
            .unwrap();
        let event = queue
            .next_event("driver-1", Utc::now(), false)
            .await
            .unwrap()
            .unwrap();

        EventWork::new(context, event, emit(vec!["a", "b", "c"]))
            .run()
            .await
            .unwrap();

        let queued = queue.events(0, 10).await.unwrap();
        assert_eq!(queued.len(), 3);
        assert!(queued
            .iter()
            .all(|e| matches!(e.driver_id.as_deref(), Some("d-a") | Some("d-b"))));
    }
}
