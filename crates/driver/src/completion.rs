//! Run progress estimates
//!
//! Estimators answer "how far along is the run" from the result log. Store
//! queries are cached for a check period so frequent polling stays cheap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::persistence::{ResultStore, StoreError};

const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(5);

/// Estimated progress of a run
#[async_trait]
pub trait CompletionEstimator: Send + Sync {
    /// Fraction complete, in `[0, 1]`
    async fn completion(&self) -> Result<f64, StoreError>;

    async fn results_success(&self) -> Result<u64, StoreError>;

    async fn results_fail(&self) -> Result<u64, StoreError>;

    /// Whether any result has been recorded
    async fn is_started(&self) -> Result<bool, StoreError> {
        Ok(self.results_success().await? + self.results_fail().await? > 0)
    }

    async fn is_completed(&self) -> Result<bool, StoreError> {
        Ok(self.completion().await? >= 1.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    taken: Instant,
    completion: f64,
    success: u64,
    fail: u64,
}

/// Progress measured as results recorded for one event name against an
/// expected count
pub struct EventCountEstimator {
    results: Arc<dyn ResultStore>,
    event_name: String,
    expected: u64,
    check_period: Duration,
    cache: Mutex<Option<Snapshot>>,
}

impl EventCountEstimator {
    pub fn new(results: Arc<dyn ResultStore>, event_name: impl Into<String>, expected: u64) -> Self {
        Self {
            results,
            event_name: event_name.into(),
            expected,
            check_period: DEFAULT_CHECK_PERIOD,
            cache: Mutex::new(None),
        }
    }

    pub fn with_check_period(mut self, period: Duration) -> Self {
        self.check_period = period;
        self
    }

    async fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let mut cache = self.cache.lock().await;
        if let Some(snapshot) = *cache {
            if snapshot.taken.elapsed() < self.check_period {
                return Ok(snapshot);
            }
        }

        let snapshot = Snapshot {
            taken: Instant::now(),
            completion: self.measure().await?,
            success: self.results.count_successes().await?,
            fail: self.results.count_failures().await?,
        };
        *cache = Some(snapshot);
        Ok(snapshot)
    }

    async fn measure(&self) -> Result<f64, StoreError> {
        if self.expected == 0 {
            return Ok(1.0);
        }
        let mut count = self
            .results
            .count_results_by_event_name(&self.event_name)
            .await?;
        if count > self.expected {
            warn!(
                event_name = %self.event_name,
                count,
                expected = self.expected,
                "Result count exceeds the expected total"
            );
            count = self.expected;
        }
        Ok(count as f64 / self.expected as f64)
    }
}

#[async_trait]
impl CompletionEstimator for EventCountEstimator {
    async fn completion(&self) -> Result<f64, StoreError> {
        Ok(self.snapshot().await?.completion)
    }

    async fn results_success(&self) -> Result<u64, StoreError> {
        Ok(self.snapshot().await?.success)
    }

    async fn results_fail(&self) -> Result<u64, StoreError> {
        Ok(self.snapshot().await?.fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventData, EventSummary};
    use crate::persistence::{EventRecord, InMemoryStore};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn record(name: &str, success: bool) -> EventRecord {
        let event = Event::new(name, Utc::now(), EventData::none());
        EventRecord {
            id: Uuid::now_v7(),
            driver_id: "d1".to_string(),
            event: EventSummary::from(&event),
            success,
            start_time: Utc::now(),
            duration_ms: 1,
            message: json!("ok"),
            chart: true,
            processed_by: "test".to_string(),
            warning: None,
            next_events: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_cached_for_check_period() {
        let store = Arc::new(InMemoryStore::new());
        let estimator = EventCountEstimator::new(store.clone(), "work", 4);

        store.record_result(record("work", true)).await.unwrap();
        assert_eq!(estimator.completion().await.unwrap(), 0.25);
        assert!(estimator.is_started().await.unwrap());

        store.record_result(record("work", false)).await.unwrap();
        assert_eq!(estimator.completion().await.unwrap(), 0.25);

        tokio::time::advance(DEFAULT_CHECK_PERIOD).await;
        assert_eq!(estimator.completion().await.unwrap(), 0.5);
        assert_eq!(estimator.results_success().await.unwrap(), 1);
        assert_eq!(estimator.results_fail().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_completion_capped_at_one() {
        let store = Arc::new(InMemoryStore::new());
        for _ in 0..3 {
            store.record_result(record("work", true)).await.unwrap();
        }
        let estimator = EventCountEstimator::new(store, "work", 2);
        assert_eq!(estimator.completion().await.unwrap(), 1.0);
        assert!(estimator.is_completed().await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_expected_is_complete() {
        let store = Arc::new(InMemoryStore::new());
        let estimator = EventCountEstimator::new(store, "work", 0);
        assert!(estimator.is_completed().await.unwrap());
        assert!(!estimator.is_started().await.unwrap());
    }
}
