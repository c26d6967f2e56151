//! Event execution
//!
//! Processors, their registry, the billable-time stopwatch and the work unit
//! that ties them to the queue and the result log.

mod processor;
mod registry;
mod stopwatch;
mod work;

pub use processor::{EventProcessor, EventResult, NoOpProcessor, ProcessorError, ProcessorOptions};
pub use registry::{ProcessorLookup, ProcessorRegistry, RegistryError};
pub use stopwatch::StopWatch;
pub use work::{EventWork, WorkContext};
