use async_trait::async_trait;
use chrono::Utc;

use crate::engine::{EventProcessor, EventResult, ProcessorError, ProcessorOptions, StopWatch};
use crate::event::{Event, EventData};

/// Emits one event per configured name, scheduled immediately
#[derive(Debug, Clone)]
pub struct RaiseSingleEventProcessor {
    output_event_names: Vec<String>,
}

impl RaiseSingleEventProcessor {
    pub fn new<I, S>(output_event_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            output_event_names: output_event_names.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl EventProcessor for RaiseSingleEventProcessor {
    fn name(&self) -> &str {
        "raise_single_event"
    }

    fn options(&self) -> ProcessorOptions {
        ProcessorOptions::default().with_chart(false)
    }

    async fn process_event(
        &self,
        _event: &Event,
        _timer: &mut StopWatch,
    ) -> Result<EventResult, ProcessorError> {
        let now = Utc::now();
        let next_events = self
            .output_event_names
            .iter()
            .map(|name| Event::new(name.as_str(), now, EventData::none()));
        Ok(EventResult::success(format!(
            "Raised events: {}",
            self.output_event_names.join(", ")
        ))
        .with_next_events(next_events))
    }
}
