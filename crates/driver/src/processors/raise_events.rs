//! Bulk event generation

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::offset;
use crate::engine::{EventProcessor, EventResult, ProcessorError, ProcessorOptions, StopWatch};
use crate::event::{Event, EventData};

/// Name the processor reschedules itself under
pub const EVENT_NAME_RAISE_EVENTS: &str = "raiseEvents";

const DEFAULT_BATCH_SIZE: u64 = 1000;

/// Progress carried between batches
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RaiseProgress {
    raised: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    last_time: DateTime<Utc>,
}

/// Emits `count` events named `output_event_name`, spaced
/// `time_between_events` apart
///
/// Events are raised in batches; between batches the processor reschedules
/// itself as [`EVENT_NAME_RAISE_EVENTS`] carrying its progress, so register it
/// under that name as well as under the event that triggers it.
#[derive(Debug, Clone)]
pub struct RaiseEventsProcessor {
    output_event_name: String,
    time_between_events: Duration,
    count: u64,
    batch_size: u64,
    reschedule_event_name: String,
}

impl RaiseEventsProcessor {
    pub fn new(output_event_name: impl Into<String>, time_between_events: Duration, count: u64) -> Self {
        Self {
            output_event_name: output_event_name.into(),
            time_between_events,
            count,
            batch_size: DEFAULT_BATCH_SIZE,
            reschedule_event_name: EVENT_NAME_RAISE_EVENTS.to_string(),
        }
    }

    /// Events raised per invocation
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_reschedule_event_name(mut self, name: impl Into<String>) -> Self {
        self.reschedule_event_name = name.into();
        self
    }

    pub fn reschedule_event_name(&self) -> &str {
        &self.reschedule_event_name
    }
}

#[async_trait]
impl EventProcessor for RaiseEventsProcessor {
    fn name(&self) -> &str {
        "raise_events"
    }

    fn options(&self) -> ProcessorOptions {
        ProcessorOptions::default().with_chart(false)
    }

    async fn process_event(
        &self,
        event: &Event,
        _timer: &mut StopWatch,
    ) -> Result<EventResult, ProcessorError> {
        let progress = match &event.data {
            EventData::Transient(_) => {
                return Ok(EventResult::failure("raising events takes no in-memory input"));
            }
            EventData::Persisted(serde_json::Value::Null) => RaiseProgress {
                raised: 0,
                // Progress is persisted at millisecond precision
                last_time: Utc::now().trunc_subsecs(3),
            },
            EventData::Persisted(value) => match serde_json::from_value(value.clone()) {
                Ok(progress) => progress,
                Err(e) => {
                    return Ok(EventResult::failure(json!({
                        "error": format!("unrecognized progress data: {e}"),
                    })));
                }
            },
        };

        let spacing = offset(self.time_between_events);
        let mut raised = progress.raised;
        let mut time = progress.last_time;
        let mut batch = Vec::new();
        while raised < self.count && (batch.len() as u64) < self.batch_size {
            raised += 1;
            time += spacing;
            batch.push(Event::new(self.output_event_name.as_str(), time, EventData::none()));
        }

        let message = format!("Scheduled {} events named {}", batch.len(), self.output_event_name);
        let mut result = EventResult::success(message).with_next_events(batch);

        if raised < self.count {
            let progress = RaiseProgress {
                raised,
                last_time: time,
            };
            let data = serde_json::to_value(&progress)
                .map_err(|e| ProcessorError::failed(e.to_string()))?;
            result = result.with_next_event(Event::new(
                self.reschedule_event_name.as_str(),
                time,
                EventData::Persisted(data),
            ));
        }
        Ok(result)
    }
}
