//! Processor registry
//!
//! Maps event names to processors. It is filled during setup and then
//! shared read-only, so concurrent lookups never contend.

use std::collections::HashMap;
use std::sync::Arc;

use super::processor::{EventProcessor, NoOpProcessor};

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A processor is already registered for this event name
    #[error("processor already registered for event: {0}")]
    DuplicateProcessor(String),
}

/// Result of looking up an event name
#[derive(Clone)]
pub enum ProcessorLookup {
    /// A processor is registered for the name
    Mapped(Arc<dyn EventProcessor>),

    /// Nothing is registered; the event is absorbed
    Unmapped,
}

impl ProcessorLookup {
    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }

    /// The processor to run; the absorbing no-op when unmapped
    pub fn processor(&self) -> Arc<dyn EventProcessor> {
        match self {
            Self::Mapped(processor) => Arc::clone(processor),
            Self::Unmapped => Arc::new(NoOpProcessor),
        }
    }
}

impl std::fmt::Debug for ProcessorLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mapped(processor) => f.debug_tuple("Mapped").field(&processor.name()).finish(),
            Self::Unmapped => f.write_str("Unmapped"),
        }
    }
}

/// Processors keyed by event name
///
/// # Example
///
/// ```ignore
/// let mut registry = ProcessorRegistry::new();
/// registry.register("start", RaiseEventsProcessor::new("work", Duration::from_millis(10), 100))?;
/// let registry = Arc::new(registry);
/// ```
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn EventProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for an event name
    pub fn register(
        &mut self,
        event_name: impl Into<String>,
        processor: impl EventProcessor,
    ) -> Result<(), RegistryError> {
        self.register_arc(event_name, Arc::new(processor))
    }

    /// Register a shared processor for an event name
    pub fn register_arc(
        &mut self,
        event_name: impl Into<String>,
        processor: Arc<dyn EventProcessor>,
    ) -> Result<(), RegistryError> {
        let event_name = event_name.into();
        if self.processors.contains_key(&event_name) {
            return Err(RegistryError::DuplicateProcessor(event_name));
        }
        self.processors.insert(event_name, processor);
        Ok(())
    }

    /// Look up the processor for an event name
    pub fn resolve(&self, event_name: &str) -> ProcessorLookup {
        match self.processors.get(event_name) {
            Some(processor) => ProcessorLookup::Mapped(Arc::clone(processor)),
            None => ProcessorLookup::Unmapped,
        }
    }

    pub fn contains(&self, event_name: &str) -> bool {
        self.processors.contains_key(event_name)
    }

    /// Registered event names
    pub fn event_names(&self) -> Vec<&str> {
        self.processors.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("event_names", &self.event_names())
            .finish()
    }
}
