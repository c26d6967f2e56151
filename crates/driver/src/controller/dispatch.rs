//! Dispatch controller
//!
//! One supervisor task per driver claims events at a throttled rate and hands
//! them to a bounded pool of work units. Any number of drivers, in any number
//! of processes, may share a queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use super::throttle::AdmissionThrottle;
use crate::engine::{EventWork, ProcessorRegistry, WorkContext};
use crate::event::{Event, EVENT_NAME_START};
use crate::persistence::{ResultStore, SessionStore, StoreError};
use crate::queue::EventQueue;
use crate::routing::EventProducerRegistry;

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Unique driver ID (generated if not provided)
    pub driver_id: String,

    /// Size of the worker pool
    pub thread_count: usize,

    /// Claim attempts allowed per second for each worker; a ceiling, not a target
    pub events_per_second_per_thread: u32,

    /// Drivers that follow-up events may be pinned to; empty leaves them unpinned
    pub driver_ids: Vec<String>,

    /// How long stop waits for in-flight work before cancelling it
    #[serde(with = "duration_millis")]
    pub shutdown_grace_period: Duration,

    /// How long stop waits for cancelled work to unwind
    #[serde(with = "duration_millis")]
    pub force_cancel_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            driver_id: format!("driver-{}", Uuid::now_v7()),
            thread_count: 4,
            events_per_second_per_thread: 2,
            driver_ids: Vec::new(),
            shutdown_grace_period: Duration::from_secs(30),
            force_cancel_timeout: Duration::from_secs(5),
        }
    }
}

impl ControllerConfig {
    /// Create a new controller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the driver ID
    pub fn with_driver_id(mut self, id: impl Into<String>) -> Self {
        self.driver_id = id.into();
        self
    }

    /// Set the worker pool size
    pub fn with_thread_count(mut self, count: usize) -> Self {
        self.thread_count = count.max(1);
        self
    }

    /// Set the per-worker claim rate ceiling
    pub fn with_events_per_second_per_thread(mut self, rate: u32) -> Self {
        self.events_per_second_per_thread = rate.max(1);
        self
    }

    /// Set the drivers follow-up events may be pinned to
    pub fn with_driver_ids(mut self, ids: Vec<String>) -> Self {
        self.driver_ids = ids;
        self
    }

    /// Set the graceful shutdown period
    pub fn with_shutdown_grace_period(mut self, period: Duration) -> Self {
        self.shutdown_grace_period = period;
        self
    }

    /// Set the wait after force-cancelling work
    pub fn with_force_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.force_cancel_timeout = timeout;
        self
    }

    /// Raise a zero pool size or rate to one; deserialized configs skip the
    /// builder clamps
    fn clamped(mut self) -> Self {
        if self.thread_count == 0 {
            warn!("thread_count of 0 raised to 1");
            self.thread_count = 1;
        }
        if self.events_per_second_per_thread == 0 {
            warn!("events_per_second_per_thread of 0 raised to 1");
            self.events_per_second_per_thread = 1;
        }
        self
    }

    /// Claim attempts allowed per second across the pool
    pub fn events_per_second(&self) -> f64 {
        self.thread_count as f64 * f64::from(self.events_per_second_per_thread)
    }
}

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Built, not started
    Created,
    /// Dispatch loop running
    Running,
    /// Draining in-flight work
    Stopping,
    /// Stopped for good
    Stopped,
}

/// Controller errors
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Start called outside the created state
    #[error("controller cannot start from state {0:?}")]
    InvalidState(ControllerState),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Shared by the controller handle and its dispatch loop
struct Dispatcher {
    config: ControllerConfig,
    queue: Arc<EventQueue>,
    results: Arc<dyn ResultStore>,
    processors: Arc<ProcessorRegistry>,
    context: Arc<WorkContext>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    completion_tx: watch::Sender<bool>,
    unmapped_warned: Mutex<HashSet<String>>,
    stale_drivers_warned: Mutex<HashSet<String>>,
}

/// Drives a run: claims events and dispatches them to work units
///
/// # Example
///
/// ```ignore
/// let controller = EventController::new(config, queue, store.clone(), store, processors, producers);
/// controller.start()?;
///
/// controller.wait_for_completion().await;
/// controller.stop().await;
/// ```
pub struct EventController {
    dispatcher: Arc<Dispatcher>,
    state_tx: watch::Sender<ControllerState>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventController {
    /// Create a controller; nothing runs until [`start`](Self::start)
    pub fn new(
        config: ControllerConfig,
        queue: Arc<EventQueue>,
        results: Arc<dyn ResultStore>,
        sessions: Arc<dyn SessionStore>,
        processors: Arc<ProcessorRegistry>,
        producers: Arc<EventProducerRegistry>,
    ) -> Self {
        let config = config.clamped();
        let context = Arc::new(
            WorkContext::new(
                config.driver_id.clone(),
                Arc::clone(&queue),
                Arc::clone(&results),
                sessions,
                producers,
            )
            .with_driver_ids(&config.driver_ids),
        );
        let (state_tx, _) = watch::channel(ControllerState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        let (completion_tx, _) = watch::channel(false);

        let dispatcher = Dispatcher {
            permits: Arc::new(Semaphore::new(config.thread_count)),
            config,
            queue,
            results,
            processors,
            context,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            completion_tx,
            unmapped_warned: Mutex::new(HashSet::new()),
            stale_drivers_warned: Mutex::new(HashSet::new()),
        };

        Self {
            dispatcher: Arc::new(dispatcher),
            state_tx,
            shutdown_tx,
            loop_handle: Mutex::new(None),
        }
    }

    /// Spawn the dispatch loop; returns immediately
    ///
    /// Must be called within a Tokio runtime.
    #[instrument(skip(self), fields(driver_id = %self.dispatcher.config.driver_id))]
    pub fn start(&self) -> Result<(), ControllerError> {
        let mut current = ControllerState::Created;
        let started = self.state_tx.send_if_modified(|state| {
            current = *state;
            if *state == ControllerState::Created {
                *state = ControllerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ControllerError::InvalidState(current));
        }

        info!(
            thread_count = self.dispatcher.config.thread_count,
            events_per_second = self.dispatcher.config.events_per_second(),
            "Starting event controller"
        );

        let dispatcher = Arc::clone(&self.dispatcher);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });
        *self.loop_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop claiming, drain in-flight work, then cancel what remains
    ///
    /// Idempotent. Every caller returns once the controller is stopped.
    #[instrument(skip(self), fields(driver_id = %self.dispatcher.config.driver_id))]
    pub async fn stop(&self) {
        let mut previous = ControllerState::Created;
        self.state_tx.send_if_modified(|state| {
            previous = *state;
            match *state {
                ControllerState::Created => {
                    *state = ControllerState::Stopped;
                    true
                }
                ControllerState::Running => {
                    *state = ControllerState::Stopping;
                    true
                }
                ControllerState::Stopping | ControllerState::Stopped => false,
            }
        });

        if previous != ControllerState::Running {
            self.wait_stopped().await;
            return;
        }

        info!("Stopping event controller");
        self.shutdown_tx.send_replace(true);

        let handle = self.loop_handle.lock().take();
        let abort = handle.as_ref().map(|h| h.abort_handle());
        let tracker = self.dispatcher.tracker.clone();
        let drain = async move {
            if let Some(handle) = handle {
                let _ = handle.await;
            }
            tracker.close();
            tracker.wait().await;
        };
        tokio::pin!(drain);

        let grace = self.dispatcher.config.shutdown_grace_period;
        if tokio::time::timeout(grace, &mut drain).await.is_err() {
            warn!(
                in_flight = self.dispatcher.tracker.len(),
                "Grace period elapsed; cancelling in-flight work"
            );
            self.dispatcher.cancel.cancel();

            let timeout = self.dispatcher.config.force_cancel_timeout;
            if tokio::time::timeout(timeout, &mut drain).await.is_err() {
                warn!("Cancelled work did not finish; aborting dispatch loop");
                if let Some(abort) = abort {
                    abort.abort();
                }
            }
        }

        self.state_tx.send_replace(ControllerState::Stopped);
        info!("Event controller stopped");
    }

    /// Wait until the controller reaches [`ControllerState::Stopped`]
    pub async fn wait_stopped(&self) {
        let mut state_rx = self.state_tx.subscribe();
        let _ = state_rx
            .wait_for(|state| *state == ControllerState::Stopped)
            .await;
    }

    /// Flips to `true` once the run is complete: the queue is empty and the
    /// start event has a result
    pub fn completion(&self) -> watch::Receiver<bool> {
        self.dispatcher.completion_tx.subscribe()
    }

    /// Wait for run completion
    pub async fn wait_for_completion(&self) {
        let mut completion_rx = self.completion();
        let _ = completion_rx.wait_for(|done| *done).await;
    }

    pub fn is_complete(&self) -> bool {
        *self.dispatcher.completion_tx.borrow()
    }

    pub fn state(&self) -> ControllerState {
        *self.state_tx.borrow()
    }

    pub fn driver_id(&self) -> &str {
        &self.dispatcher.config.driver_id
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.dispatcher.config
    }

    /// Work units currently running on the pool
    pub fn in_flight(&self) -> usize {
        self.dispatcher.tracker.len()
    }

    /// Events left in the queue, including those being processed
    pub async fn queue_depth(&self) -> Result<u64, ControllerError> {
        Ok(self.dispatcher.queue.count().await?)
    }
}

impl Dispatcher {
    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        match self.dispatch_loop(&mut shutdown_rx).await {
            Ok(()) => debug!("Dispatch loop exited"),
            Err(e) if *shutdown_rx.borrow() => {
                debug!(error = %e, "Dispatch loop error during shutdown");
            }
            Err(e) => {
                error!(error = %e, "Dispatch loop failed; controller stalled until stopped");
            }
        }
    }

    async fn dispatch_loop(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), StoreError> {
        let driver_id = self.config.driver_id.as_str();
        let mut throttle = AdmissionThrottle::new(self.config.events_per_second());

        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }

            if !throttle.try_admit() {
                if wait(shutdown_rx, throttle.interval()).await {
                    return Ok(());
                }
                continue;
            }

            let now = Utc::now();
            let event = match self.queue.next_event(driver_id, now, true).await? {
                Some(event) => Some(event),
                None => self.queue.next_event(driver_id, now, false).await?,
            };

            match event {
                Some(event) => self.dispatch(event).await,
                None => {
                    trace!("No event ready");
                    self.check_completion().await?;
                }
            }

            // In-memory stores never suspend; let work units run
            tokio::task::yield_now().await;
        }
    }

    async fn dispatch(&self, event: Event) {
        if let Some(owner) = event.driver_id.as_deref() {
            if owner != self.config.driver_id
                && self.stale_drivers_warned.lock().insert(owner.to_string())
            {
                warn!(
                    stale_driver = owner,
                    event_name = %event.name,
                    "Claimed an event pinned to another driver; that driver appears to have stopped"
                );
            }
        }

        let lookup = self.processors.resolve(&event.name);
        if !lookup.is_mapped() {
            debug!(event_name = %event.name, "No processor mapped; absorbing event");
            if self.unmapped_warned.lock().insert(event.name.clone()) {
                warn!(event_name = %event.name, "No processor mapped for event name");
            }
        }

        let work = EventWork::new(Arc::clone(&self.context), event, lookup.processor());
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                let queue = Arc::clone(&self.queue);
                let cancel = self.cancel.clone();
                self.tracker.spawn(async move {
                    run_cancellable(work, &queue, &cancel).await;
                    drop(permit);
                });
            }
            Err(_) => {
                // Pool saturated: run on the supervisor, which holds back further claims
                trace!("Worker pool saturated; running work on the dispatch loop");
                run_cancellable(work, &self.queue, &self.cancel).await;
            }
        }
    }

    async fn check_completion(&self) -> Result<(), StoreError> {
        if self.queue.count().await? > 0 {
            return Ok(());
        }

        if self.results.count_results_by_event_name(EVENT_NAME_START).await? == 0 {
            match self.queue.put_event(Event::start(Utc::now())).await {
                Ok(_) => info!("Queued start event"),
                Err(e) if e.is_duplicate_key() => {
                    debug!("Start event already queued by another driver");
                }
                Err(e) => return Err(e),
            }
            return Ok(());
        }

        // The start event may have run since the first count; its follow-ups
        // are queued before its result is recorded, so recount
        if self.queue.count().await? > 0 {
            return Ok(());
        }

        let newly_complete = self.completion_tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        });
        if newly_complete {
            info!("Run complete: queue drained");
        }
        Ok(())
    }
}

async fn run_cancellable(work: EventWork, queue: &EventQueue, cancel: &CancellationToken) {
    let event = work.event().clone();
    tokio::select! {
        result = work.run() => {
            if let Err(e) = result {
                error!(event_id = %event.id, event_name = %event.name, error = %e, "Work unit failed");
                // Second attempt; a leftover claim would block completion
                if let Err(e) = queue.delete_event(&event).await {
                    warn!(event_id = %event.id, error = %e, "Failed to remove event after work unit failure");
                }
            }
        }
        _ = cancel.cancelled() => {
            warn!(event_id = %event.id, event_name = %event.name, "Work unit cancelled; result not recorded");
            // The claim is spent; remove the event so it is not left behind
            if let Err(e) = queue.delete_event(&event).await {
                warn!(event_id = %event.id, error = %e, "Failed to remove cancelled event");
            }
        }
    }
}

/// Sleep for `interval`; returns true if shutdown was signalled first
async fn wait(shutdown_rx: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        _ = shutdown_rx.changed() => {
            debug!("Shutdown signal received during wait");
            true
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
