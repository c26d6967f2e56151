//! End-to-end dispatch tests against the in-memory store
//!
//! Run with: cargo test -p benchrun-driver --test dispatch_test

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_test::assert_ok;

use benchrun_driver::prelude::*;

const RUN_TIMEOUT: Duration = Duration::from_secs(30);

/// Sleeps briefly and reports `work.done`
struct Work;

#[async_trait]
impl EventProcessor for Work {
    fn name(&self) -> &str {
        "work"
    }

    async fn process_event(
        &self,
        _event: &Event,
        _timer: &mut StopWatch,
    ) -> Result<EventResult, ProcessorError> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(EventResult::success("worked").with_next_event(Event::new(
            "work.done",
            Utc::now(),
            EventData::none(),
        )))
    }
}

/// Hands a live counter to each follow-up
struct Share {
    counter: Arc<AtomicUsize>,
    count: usize,
}

#[async_trait]
impl EventProcessor for Share {
    fn name(&self) -> &str {
        "share"
    }

    async fn process_event(
        &self,
        _event: &Event,
        _timer: &mut StopWatch,
    ) -> Result<EventResult, ProcessorError> {
        let now = Utc::now();
        Ok(EventResult::success("shared").with_next_events(
            (0..self.count).map(|_| Event::with_transient("consume", now, self.counter.clone())),
        ))
    }
}

struct Consume;

#[async_trait]
impl EventProcessor for Consume {
    fn name(&self) -> &str {
        "consume"
    }

    async fn process_event(
        &self,
        event: &Event,
        _timer: &mut StopWatch,
    ) -> Result<EventResult, ProcessorError> {
        let counter = event
            .data
            .as_transient()
            .and_then(|data| data.downcast_ref::<Arc<AtomicUsize>>())
            .ok_or_else(|| ProcessorError::failed("missing live counter"))?;
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(EventResult::success("consumed"))
    }
}

/// Fails the first `work` result it is asked to record
struct DroppedWrite {
    inner: Arc<InMemoryStore>,
    dropped: AtomicBool,
}

#[async_trait]
impl ResultStore for DroppedWrite {
    async fn record_result(&self, record: EventRecord) -> Result<(), StoreError> {
        if record.event.name == "work" && !self.dropped.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Database("connection reset".to_string()));
        }
        self.inner.record_result(record).await
    }

    async fn first_result(&self) -> Result<Option<EventRecord>, StoreError> {
        self.inner.first_result().await
    }

    async fn last_result(&self) -> Result<Option<EventRecord>, StoreError> {
        self.inner.last_result().await
    }

    async fn results_by_event_name(
        &self,
        event_name: &str,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.inner.results_by_event_name(event_name, skip, limit).await
    }

    async fn results_in_window(
        &self,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
        chart_only: bool,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.inner
            .results_in_window(start, end, chart_only, skip, limit)
            .await
    }

    async fn event_names(&self) -> Result<Vec<String>, StoreError> {
        self.inner.event_names().await
    }

    async fn count_results(&self) -> Result<u64, StoreError> {
        self.inner.count_results().await
    }

    async fn count_results_by_event_name(&self, event_name: &str) -> Result<u64, StoreError> {
        self.inner.count_results_by_event_name(event_name).await
    }

    async fn count_successes(&self) -> Result<u64, StoreError> {
        self.inner.count_successes().await
    }

    async fn count_failures(&self) -> Result<u64, StoreError> {
        self.inner.count_failures().await
    }
}

fn config(driver_id: &str) -> ControllerConfig {
    ControllerConfig::new()
        .with_driver_id(driver_id)
        .with_thread_count(4)
        .with_events_per_second_per_thread(1000)
        .with_shutdown_grace_period(Duration::from_secs(2))
}

fn work_scenario(count: u64) -> (ProcessorRegistry, EventProducerRegistry) {
    let raise = Arc::new(RaiseEventsProcessor::new("work", Duration::from_millis(1), count));
    let mut processors = ProcessorRegistry::new();
    processors.register_arc(EVENT_NAME_START, raise.clone()).unwrap();
    processors.register_arc(EVENT_NAME_RAISE_EVENTS, raise).unwrap();
    processors.register("work", Work).unwrap();

    let mut producers = EventProducerRegistry::new();
    producers.register("work.done", TerminateProducer).unwrap();
    (processors, producers)
}

fn controller(
    config: ControllerConfig,
    store: &Arc<InMemoryStore>,
    queue: &Arc<EventQueue>,
    processors: &Arc<ProcessorRegistry>,
    producers: &Arc<EventProducerRegistry>,
) -> EventController {
    EventController::new(
        config,
        queue.clone(),
        store.clone(),
        store.clone(),
        processors.clone(),
        producers.clone(),
    )
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_run_processes_every_event_once() {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(EventQueue::new(store.clone(), QueueConfig::default()));
    let (processors, producers) = work_scenario(50);
    let controller = controller(
        config("d1"),
        &store,
        &queue,
        &Arc::new(processors),
        &Arc::new(producers),
    );

    assert_ok!(controller.start());
    tokio::time::timeout(RUN_TIMEOUT, controller.wait_for_completion())
        .await
        .expect("run should complete");
    controller.stop().await;

    assert_eq!(assert_ok!(store.count_results().await), 51);
    assert_eq!(store.count_results_by_event_name("start").await.unwrap(), 1);
    assert_eq!(store.count_results_by_event_name("work").await.unwrap(), 50);
    assert_eq!(store.count_failures().await.unwrap(), 0);
    assert_eq!(queue.count().await.unwrap(), 0);

    let work = store.results_by_event_name("work", 0, 100).await.unwrap();
    let ids: HashSet<_> = work.iter().map(|r| r.event.id).collect();
    assert_eq!(ids.len(), 50);
    assert!(work.iter().all(|r| r.driver_id == "d1" && r.next_events.is_empty()));

    let start = store.results_by_event_name("start", 0, 1).await.unwrap();
    assert_eq!(start[0].next_events.len(), 50);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_queue_drains_monotonically() {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(EventQueue::new(store.clone(), QueueConfig::default()));
    let raise = Arc::new(RaiseEventsProcessor::new("work", Duration::from_millis(5), 200));
    let mut processors = ProcessorRegistry::new();
    processors.register_arc(EVENT_NAME_START, raise).unwrap();
    processors.register("work", Work).unwrap();
    let mut producers = EventProducerRegistry::new();
    producers.register("work.done", TerminateProducer).unwrap();

    let controller = controller(
        config("d1"),
        &store,
        &queue,
        &Arc::new(processors),
        &Arc::new(producers),
    );
    controller.start().unwrap();

    // The start result is recorded after every work event is queued
    tokio::time::timeout(RUN_TIMEOUT, async {
        while store.count_results_by_event_name("start").await.unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("start should run");

    let mut samples = Vec::new();
    tokio::time::timeout(RUN_TIMEOUT, async {
        loop {
            samples.push(queue.count().await.unwrap());
            if controller.is_complete() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run should complete");
    samples.push(queue.count().await.unwrap());
    controller.stop().await;

    assert!(
        samples.windows(2).all(|pair| pair[1] <= pair[0]),
        "queue count increased while draining: {samples:?}"
    );
    assert_eq!(samples.last(), Some(&0));
    assert_eq!(store.count_results_by_event_name("work").await.unwrap(), 200);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_failed_result_write_does_not_stall_run() {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(EventQueue::new(store.clone(), QueueConfig::default()));
    let results = Arc::new(DroppedWrite {
        inner: store.clone(),
        dropped: AtomicBool::new(false),
    });
    let (processors, producers) = work_scenario(5);

    let controller = EventController::new(
        config("d1"),
        queue.clone(),
        results.clone(),
        store.clone(),
        Arc::new(processors),
        Arc::new(producers),
    );
    controller.start().unwrap();
    tokio::time::timeout(RUN_TIMEOUT, controller.wait_for_completion())
        .await
        .expect("run should complete despite a failed result write");
    controller.stop().await;

    assert!(results.dropped.load(Ordering::SeqCst));
    // The failed unit's event is gone and its result was lost
    assert_eq!(queue.count().await.unwrap(), 0);
    assert_eq!(store.count_results_by_event_name("work").await.unwrap(), 4);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_drivers_share_one_queue() {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(EventQueue::new(store.clone(), QueueConfig::default()));
    let (processors, producers) = work_scenario(100);
    let processors = Arc::new(processors);
    let producers = Arc::new(producers);
    let drivers = vec!["d1".to_string(), "d2".to_string()];

    let first = controller(
        config("d1").with_driver_ids(drivers.clone()),
        &store,
        &queue,
        &processors,
        &producers,
    );
    let second = controller(
        config("d2").with_driver_ids(drivers),
        &store,
        &queue,
        &processors,
        &producers,
    );

    first.start().unwrap();
    second.start().unwrap();
    tokio::time::timeout(RUN_TIMEOUT, async {
        tokio::join!(first.wait_for_completion(), second.wait_for_completion())
    })
    .await
    .expect("both drivers should see completion");
    tokio::join!(first.stop(), second.stop());

    // Both drivers raced to bootstrap; only one start event ran
    assert_eq!(store.count_results_by_event_name("start").await.unwrap(), 1);

    let work = store.results_by_event_name("work", 0, 200).await.unwrap();
    assert_eq!(work.len(), 100);
    let ids: HashSet<_> = work.iter().map(|r| r.event.id).collect();
    assert_eq!(ids.len(), 100);
    assert_eq!(queue.count().await.unwrap(), 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_transient_payload_reaches_processor() {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(EventQueue::new(store.clone(), QueueConfig::default()));
    let counter = Arc::new(AtomicUsize::new(0));

    let mut processors = ProcessorRegistry::new();
    processors
        .register(
            EVENT_NAME_START,
            Share {
                counter: counter.clone(),
                count: 10,
            },
        )
        .unwrap();
    processors.register("consume", Consume).unwrap();

    let controller = controller(
        config("d1").with_driver_ids(vec!["d1".to_string(), "d2".to_string()]),
        &store,
        &queue,
        &Arc::new(processors),
        &Arc::new(EventProducerRegistry::new()),
    );

    controller.start().unwrap();
    tokio::time::timeout(RUN_TIMEOUT, controller.wait_for_completion())
        .await
        .expect("run should complete");
    controller.stop().await;

    assert_eq!(counter.load(Ordering::SeqCst), 10);
    assert_eq!(store.count_successes().await.unwrap(), 11);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_stop_is_idempotent_and_concurrent() {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(EventQueue::new(store.clone(), QueueConfig::default()));
    let (processors, producers) = work_scenario(1_000);
    let controller = controller(
        config("d1").with_events_per_second_per_thread(50),
        &store,
        &queue,
        &Arc::new(processors),
        &Arc::new(producers),
    );

    controller.start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(RUN_TIMEOUT, async {
        tokio::join!(controller.stop(), controller.stop(), controller.stop())
    })
    .await
    .expect("stop should finish");
    assert_eq!(controller.state(), ControllerState::Stopped);
    assert!(!controller.is_complete());
    assert_eq!(controller.in_flight(), 0);

    // Stopped drivers leave unprocessed events in the queue
    let processed = store.count_results().await.unwrap();
    assert!(processed < 1_001);
    assert!(queue.count().await.unwrap() > 0);

    controller.stop().await;
    assert!(matches!(
        controller.start(),
        Err(ControllerError::InvalidState(ControllerState::Stopped))
    ));
}
