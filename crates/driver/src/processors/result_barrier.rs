//! Holds a scenario back until enough results exist for an event name

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::offset;
use crate::engine::{EventProcessor, EventResult, ProcessorError, ProcessorOptions, StopWatch};
use crate::event::{Event, EventData};
use crate::persistence::ResultStore;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Re-checks every `check_interval` until `count_event_name` has at least
/// `expected` results, then emits `next_event_name`
pub struct ResultBarrierProcessor {
    count_event_name: String,
    expected: u64,
    next_event_name: String,
    check_interval: Duration,
    results: Arc<dyn ResultStore>,
}

impl ResultBarrierProcessor {
    pub fn new(
        count_event_name: impl Into<String>,
        expected: u64,
        next_event_name: impl Into<String>,
        results: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            count_event_name: count_event_name.into(),
            expected,
            next_event_name: next_event_name.into(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            results,
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }
}

#[async_trait]
impl EventProcessor for ResultBarrierProcessor {
    fn name(&self) -> &str {
        "result_barrier"
    }

    fn options(&self) -> ProcessorOptions {
        ProcessorOptions::default().with_chart(false)
    }

    async fn process_event(
        &self,
        event: &Event,
        _timer: &mut StopWatch,
    ) -> Result<EventResult, ProcessorError> {
        let count = self
            .results
            .count_results_by_event_name(&self.count_event_name)
            .await?;
        let now = Utc::now();

        if count < self.expected {
            let recheck = Event::new(
                event.name.as_str(),
                now + offset(self.check_interval),
                EventData::none(),
            );
            return Ok(EventResult::success(format!(
                "Not enough results for '{}' ({}/{}), barrier holding",
                self.count_event_name, count, self.expected
            ))
            .with_next_event(recheck));
        }

        Ok(EventResult::success(format!(
            "Enough results for '{}', barrier released",
            self.count_event_name
        ))
        .with_next_event(Event::new(self.next_event_name.as_str(), now, EventData::none())))
    }
}
