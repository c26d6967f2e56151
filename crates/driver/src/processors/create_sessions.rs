//! Session pacing
//!
//! Keeps a fixed number of sessions running: the first invocation raises one
//! session event per concurrent slot, and each later check raises as many new
//! ones as sessions completed since the previous check.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{offset, ProcessorConfigError};
use crate::engine::{EventProcessor, EventResult, ProcessorError, ProcessorOptions, StopWatch};
use crate::event::{Event, EventData};
use crate::persistence::SessionStore;

/// Name the processor reschedules itself under
pub const EVENT_NAME_CREATE_SESSIONS: &str = "createSessions";

const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(10);
const DEFAULT_TIME_BETWEEN_SESSIONS: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PacingState {
    raised: u64,
    completed_sessions: u64,
}

pub struct CreateSessionsProcessor {
    sessions: Arc<dyn SessionStore>,
    output_event_name: String,
    concurrent: u64,
    total: u64,
    check_period: Duration,
    time_between_sessions: Duration,
    reschedule_event_name: String,
}

impl CreateSessionsProcessor {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        output_event_name: impl Into<String>,
        concurrent: u64,
        total: u64,
    ) -> Result<Self, ProcessorConfigError> {
        if concurrent > total {
            return Err(ProcessorConfigError::ConcurrencyExceedsTotal { concurrent, total });
        }
        Ok(Self {
            sessions,
            output_event_name: output_event_name.into(),
            concurrent,
            total,
            check_period: DEFAULT_CHECK_PERIOD,
            time_between_sessions: DEFAULT_TIME_BETWEEN_SESSIONS,
            reschedule_event_name: EVENT_NAME_CREATE_SESSIONS.to_string(),
        })
    }

    pub fn with_check_period(mut self, period: Duration) -> Self {
        self.check_period = period;
        self
    }

    /// Spacing of the initial session events
    pub fn with_time_between_sessions(
        mut self,
        spacing: Duration,
    ) -> Result<Self, ProcessorConfigError> {
        if spacing.is_zero() {
            return Err(ProcessorConfigError::ZeroInterval("time between sessions"));
        }
        self.time_between_sessions = spacing;
        Ok(self)
    }

    pub fn with_reschedule_event_name(mut self, name: impl Into<String>) -> Self {
        self.reschedule_event_name = name.into();
        self
    }
}

#[async_trait]
impl EventProcessor for CreateSessionsProcessor {
    fn name(&self) -> &str {
        "create_sessions"
    }

    fn options(&self) -> ProcessorOptions {
        ProcessorOptions::default().with_chart(false)
    }

    async fn process_event(
        &self,
        event: &Event,
        _timer: &mut StopWatch,
    ) -> Result<EventResult, ProcessorError> {
        let previous = match &event.data {
            EventData::Transient(_) => {
                return Ok(EventResult::failure("session pacing takes no in-memory input"));
            }
            EventData::Persisted(serde_json::Value::Null) => None,
            EventData::Persisted(value) => match serde_json::from_value::<PacingState>(value.clone()) {
                Ok(state) => Some(state),
                Err(e) => {
                    return Ok(EventResult::failure(json!({
                        "error": format!("unrecognized pacing data: {e}"),
                    })));
                }
            },
        };

        let now = Utc::now();
        let completed_sessions = self.sessions.completed_sessions_count().await?;

        let (raised_before, to_raise, spacing) = match previous {
            None => (0, self.concurrent, self.time_between_sessions),
            Some(state) => {
                let completed_in_wait = completed_sessions.saturating_sub(state.completed_sessions);
                let spacing = if completed_in_wait > 0 {
                    self.check_period / u32::try_from(completed_in_wait).unwrap_or(u32::MAX)
                } else {
                    Duration::ZERO
                };
                (state.raised, completed_in_wait, spacing)
            }
        };

        let to_raise = to_raise.min(self.total.saturating_sub(raised_before));
        let spacing = offset(spacing);
        let mut next_events: Vec<Event> = (0..to_raise)
            .map(|i| {
                let at = now + spacing * i32::try_from(i).unwrap_or(i32::MAX);
                Event::new(self.output_event_name.as_str(), at, EventData::none())
            })
            .collect();

        let raised = raised_before + to_raise;
        if raised < self.total {
            let state = PacingState {
                raised,
                completed_sessions,
            };
            let data = serde_json::to_value(&state)
                .map_err(|e| ProcessorError::failed(e.to_string()))?;
            next_events.push(Event::new(
                self.reschedule_event_name.as_str(),
                now + offset(self.check_period),
                EventData::Persisted(data),
            ));
        }

        Ok(EventResult::success(format!(
            "Scheduled {} events named {}",
            to_raise, self.output_event_name
        ))
        .with_next_events(next_events))
    }
}
