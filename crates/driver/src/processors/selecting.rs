//! Session chains driven by weighted event selection

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::offset;
use crate::engine::{EventProcessor, EventResult, ProcessorError, ProcessorOptions, StopWatch};
use crate::event::Event;
use crate::persistence::{SessionError, SessionStore};
use crate::routing::WeightedEventSelector;

const DEFAULT_MAX_SESSION_TIME: Duration = Duration::from_secs(5 * 60);
const KEY_MAX_END_TIME: &str = "max_end_time";

/// Wraps a processor and, after each success, picks the session's next event
///
/// A chain arriving without a session gets one. The session ends once the
/// inner processor fails, the selector has nothing to offer, or the session
/// has run past `max_session_time`.
pub struct SelectorProcessor {
    inner: Arc<dyn EventProcessor>,
    selector: WeightedEventSelector,
    sessions: Arc<dyn SessionStore>,
    max_session_time: Duration,
}

impl SelectorProcessor {
    pub fn new(
        inner: Arc<dyn EventProcessor>,
        selector: WeightedEventSelector,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            inner,
            selector,
            sessions,
            max_session_time: DEFAULT_MAX_SESSION_TIME,
        }
    }

    pub fn with_max_session_time(mut self, max: Duration) -> Self {
        self.max_session_time = max;
        self
    }

    /// Deadline stored with the session, recorded on first use
    async fn max_end_time(&self, session_id: Uuid) -> Result<DateTime<Utc>, SessionError> {
        let session = self
            .sessions
            .session(session_id)
            .await?
            .ok_or(SessionError::NotFound(session_id))?;

        let stored = session
            .data
            .as_ref()
            .and_then(|data| data.get(KEY_MAX_END_TIME))
            .and_then(|value| value.as_i64())
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        if let Some(max_end_time) = stored {
            return Ok(max_end_time);
        }

        let max_end_time = session.started_at + offset(self.max_session_time);
        self.sessions
            .set_session_data(
                session_id,
                json!({ KEY_MAX_END_TIME: max_end_time.timestamp_millis() }),
            )
            .await?;
        Ok(max_end_time)
    }

    async fn end_session(&self, session_id: Uuid) -> Result<(), SessionError> {
        match self.sessions.end_session(session_id).await {
            Ok(_) => Ok(()),
            Err(SessionError::AlreadyEnded(_)) => {
                debug!(%session_id, "Session already ended");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl EventProcessor for SelectorProcessor {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn options(&self) -> ProcessorOptions {
        // Session closing is handled here
        self.inner.options().with_auto_close_session(false)
    }

    async fn process_event(
        &self,
        event: &Event,
        timer: &mut StopWatch,
    ) -> Result<EventResult, ProcessorError> {
        let session_id = match event.session_id {
            Some(id) => id,
            None => {
                timer.suspend();
                let id = self.sessions.start_session(None).await?;
                timer.resume();
                id
            }
        };

        let outcome = self.inner.process_event(event, timer).await;
        // Only the inner work is billed
        timer.stop();

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                self.end_session(session_id).await?;
                return Err(e);
            }
        };

        let now = Utc::now();
        if result.success && now < self.max_end_time(session_id).await? {
            if let Some(next) = self.selector.next_event(event.data.clone(), now) {
                result.next_events.push(next.with_session(session_id));
            }
        }

        let carried = result
            .next_events
            .iter()
            .any(|e| e.session_id == Some(session_id));
        if !carried {
            self.end_session(session_id).await?;
        }
        Ok(result)
    }
}
