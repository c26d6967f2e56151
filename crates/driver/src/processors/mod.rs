//! Built-in processors
//!
//! Reusable building blocks for load scenarios: bulk event generation,
//! barriers on result counts, session pacing and weighted session chains.

mod create_sessions;
mod raise_events;
mod raise_single;
mod result_barrier;
mod selecting;

pub use create_sessions::{CreateSessionsProcessor, EVENT_NAME_CREATE_SESSIONS};
pub use raise_events::{RaiseEventsProcessor, EVENT_NAME_RAISE_EVENTS};
pub use raise_single::RaiseSingleEventProcessor;
pub use result_barrier::ResultBarrierProcessor;
pub use selecting::SelectorProcessor;

/// Invalid processor configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorConfigError {
    #[error("concurrent sessions ({concurrent}) cannot exceed total sessions ({total})")]
    ConcurrencyExceedsTotal { concurrent: u64, total: u64 },

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// `std` duration as a chrono offset, saturating at zero on overflow
pub(crate) fn offset(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
