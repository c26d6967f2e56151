//! Event processor contract

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::stopwatch::StopWatch;
use crate::event::Event;
use crate::persistence::{SessionError, StoreError};

/// Errors a processor may raise
///
/// Any error is recorded as a failed result for the event being processed;
/// it never reaches the controller.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// Processing failed
    #[error("{0}")]
    Failed(String),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Session error
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl ProcessorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// How the work unit treats a processor's events and results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorOptions {
    /// Log and record a warning when billable time exceeds this
    #[serde(default, with = "option_duration_millis")]
    pub warn_delay: Option<Duration>,

    /// Whether results should appear in charts
    pub chart: bool,

    /// Copy the triggering session id onto follow-up events
    pub auto_propagate_session: bool,

    /// End the triggering session when the chain stops carrying it
    pub auto_close_session: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            warn_delay: None,
            chart: true,
            auto_propagate_session: true,
            auto_close_session: true,
        }
    }
}

impl ProcessorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_warn_delay(mut self, delay: Duration) -> Self {
        self.warn_delay = Some(delay);
        self
    }

    pub fn with_chart(mut self, chart: bool) -> Self {
        self.chart = chart;
        self
    }

    pub fn with_auto_propagate_session(mut self, propagate: bool) -> Self {
        self.auto_propagate_session = propagate;
        self
    }

    pub fn with_auto_close_session(mut self, close: bool) -> Self {
        self.auto_close_session = close;
        self
    }
}

/// Outcome of processing one event
#[derive(Debug, Clone)]
pub struct EventResult {
    /// Human-readable or structured message
    pub message: serde_json::Value,
    pub success: bool,
    /// Proposed follow-up events, in order
    pub next_events: Vec<Event>,
}

impl EventResult {
    /// Successful result with no follow-ups
    pub fn success(message: impl Into<serde_json::Value>) -> Self {
        Self {
            message: message.into(),
            success: true,
            next_events: Vec::new(),
        }
    }

    /// Failed result with no follow-ups
    pub fn failure(message: impl Into<serde_json::Value>) -> Self {
        Self {
            message: message.into(),
            success: false,
            next_events: Vec::new(),
        }
    }

    /// Successful result for work skipped because an input was unavailable
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::success(json!({ "skipped": reason.into() }))
    }

    /// Append one follow-up event
    pub fn with_next_event(mut self, event: Event) -> Self {
        self.next_events.push(event);
        self
    }

    /// Append follow-up events
    pub fn with_next_events(mut self, events: impl IntoIterator<Item = Event>) -> Self {
        self.next_events.extend(events);
        self
    }
}

/// Business logic for one event name
///
/// # Example
///
/// ```ignore
/// struct Login;
///
/// #[async_trait]
/// impl EventProcessor for Login {
///     fn name(&self) -> &str { "login" }
///
///     async fn process_event(&self, event: &Event, timer: &mut StopWatch)
///         -> Result<EventResult, ProcessorError>
///     {
///         timer.suspend();
///         let user = users.fetch().await;
///         timer.resume();
///         // ...
///         Ok(EventResult::success("logged in"))
///     }
/// }
/// ```
#[async_trait]
pub trait EventProcessor: Send + Sync + 'static {
    /// Identifies the processor in results and logs
    fn name(&self) -> &str;

    fn options(&self) -> ProcessorOptions {
        ProcessorOptions::default()
    }

    /// Process the event; `timer` is running on entry
    async fn process_event(
        &self,
        event: &Event,
        timer: &mut StopWatch,
    ) -> Result<EventResult, ProcessorError>;
}

/// Absorbs events that have no processor mapped
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProcessor;

#[async_trait]
impl EventProcessor for NoOpProcessor {
    fn name(&self) -> &str {
        "noop"
    }

    fn options(&self) -> ProcessorOptions {
        ProcessorOptions::default().with_chart(false)
    }

    async fn process_event(
        &self,
        event: &Event,
        _timer: &mut StopWatch,
    ) -> Result<EventResult, ProcessorError> {
        Ok(EventResult::success(format!(
            "No processor mapped for event '{}'",
            event.name
        )))
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::event::EventData;

    #[test]
    fn test_default_options() {
        let options = ProcessorOptions::default();
        assert!(options.warn_delay.is_none());
        assert!(options.chart);
        assert!(options.auto_propagate_session);
        assert!(options.auto_close_session);
    }

    #[test]
    fn test_result_builders() {
        let next = Event::new("next", Utc::now(), EventData::none());
        let result = EventResult::success("ok").with_next_event(next);
        assert!(result.success);
        assert_eq!(result.next_events.len(), 1);
        assert_eq!(result.message, json!("ok"));

        let skipped = EventResult::skipped("no fixture");
        assert!(skipped.success);
        assert_eq!(skipped.message, json!({"skipped": "no fixture"}));

        assert!(!EventResult::failure("bad").success);
    }

    #[tokio::test]
    async fn test_noop_absorbs() {
        let event = Event::new("orphan", Utc::now(), EventData::none());
        let mut timer = StopWatch::started();
        let result = NoOpProcessor.process_event(&event, &mut timer).await.unwrap();
        assert!(result.success);
        assert!(result.next_events.is_empty());
        assert!(!NoOpProcessor.options().chart);
    }
}
