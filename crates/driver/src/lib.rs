//! # Benchrun Driver
//!
//! The dispatch core of a distributed load-testing harness. A scenario is a
//! graph of named events; drivers share one event queue, claim ready events,
//! run the processor mapped to each event's name and record one result per
//! event.
//!
//! ## Features
//!
//! - **Shared queue**: any number of drivers, in any number of processes, claim
//!   from one store; each event is handed out at most once
//! - **Rate-limited dispatch**: claim attempts are capped per worker, and a
//!   saturated pool runs work on the dispatch loop instead of queueing it
//! - **Billable timing**: processors can suspend their stopwatch around work
//!   that should not count, such as waiting for fixtures
//! - **Routing**: producers redirect, drop or randomly fan out follow-up events
//! - **Sessions**: chains of events share a session that closes when the chain ends
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      EventController                         │
//! │  (throttled claims, worker pool, completion, shutdown)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EventWork                             │
//! │  (timed processor call, producer routing, sessions)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          EventQueue / ResultStore / SessionStore             │
//! │  (PostgreSQL: benchrun_events, results, sessions)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use benchrun_driver::prelude::*;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let queue = Arc::new(EventQueue::new(store.clone(), QueueConfig::default()));
//!
//! let raise = Arc::new(RaiseEventsProcessor::new("work", Duration::from_millis(10), 100));
//! let mut processors = ProcessorRegistry::new();
//! processors.register_arc(EVENT_NAME_START, raise.clone())?;
//! processors.register_arc(EVENT_NAME_RAISE_EVENTS, raise)?;
//! processors.register("work", MyWorkProcessor)?;
//!
//! let controller = EventController::new(
//!     ControllerConfig::default(),
//!     queue,
//!     store.clone(),
//!     store,
//!     Arc::new(processors),
//!     Arc::new(EventProducerRegistry::new()),
//! );
//! controller.start()?;
//! controller.wait_for_completion().await;
//! controller.stop().await;
//! ```

pub mod completion;
pub mod controller;
pub mod engine;
pub mod event;
pub mod fixture;
pub mod persistence;
pub mod processors;
pub mod queue;
pub mod routing;

/// Prelude for common imports
pub mod prelude {
    pub use crate::completion::{CompletionEstimator, EventCountEstimator};
    pub use crate::controller::{ControllerConfig, ControllerError, ControllerState, EventController};
    pub use crate::engine::{
        EventProcessor, EventResult, ProcessorError, ProcessorOptions, ProcessorRegistry, StopWatch,
    };
    pub use crate::event::{Event, EventData, TransientData, EVENT_ID_START, EVENT_NAME_START};
    pub use crate::fixture::{FixtureSource, VecFixtureSource};
    pub use crate::persistence::{
        EventRecord, EventStore, InMemoryStore, PostgresStore, ResultStore, Session, SessionError,
        SessionStore, StoreError,
    };
    pub use crate::processors::{
        CreateSessionsProcessor, RaiseEventsProcessor, RaiseSingleEventProcessor,
        ResultBarrierProcessor, SelectorProcessor, EVENT_NAME_CREATE_SESSIONS,
        EVENT_NAME_RAISE_EVENTS,
    };
    pub use crate::queue::{EventQueue, QueueConfig};
    pub use crate::routing::{
        EventProducer, EventProducerRegistry, EventWeight, RandomRedirectProducer,
        RedirectProducer, TerminateProducer, WeightedEventSelector,
    };
}

// Re-export key types at crate root
pub use controller::{ControllerConfig, ControllerError, ControllerState, EventController};
pub use engine::{EventProcessor, EventResult, ProcessorError, ProcessorRegistry, StopWatch};
pub use event::{Event, EventData};
pub use persistence::{InMemoryStore, PostgresStore, StoreError};
pub use queue::{EventQueue, QueueConfig};
pub use routing::EventProducerRegistry;
