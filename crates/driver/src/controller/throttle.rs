//! Claim admission throttle
//!
//! Caps the rate of claim attempts without a timer task: an attempt is
//! admitted only while the attempts made so far are below
//! `floor(elapsed_seconds * events_per_second)`.

use std::time::Duration;

use tokio::time::Instant;

/// Shortest wait between admission checks
pub const MIN_THROTTLE_INTERVAL: Duration = Duration::from_millis(10);

/// Claim attempts allowed after `elapsed`
pub fn allowed_searches(elapsed: Duration, events_per_second: f64) -> u64 {
    if events_per_second <= 0.0 {
        return 0;
    }
    (elapsed.as_secs_f64() * events_per_second).floor() as u64
}

/// How long to sleep when over budget: half the target spacing, at least 10ms
pub fn throttle_interval(events_per_second: f64) -> Duration {
    if events_per_second <= 0.0 {
        return Duration::from_secs(1);
    }
    let millis = (1000.0 / events_per_second / 2.0).floor() as u64;
    Duration::from_millis(millis).max(MIN_THROTTLE_INTERVAL)
}

/// Tracks claim attempts against the admission budget
#[derive(Debug)]
pub struct AdmissionThrottle {
    started: Instant,
    searches: u64,
    events_per_second: f64,
}

impl AdmissionThrottle {
    pub fn new(events_per_second: f64) -> Self {
        Self {
            started: Instant::now(),
            searches: 0,
            events_per_second,
        }
    }

    /// Count an attempt if the budget allows one
    pub fn try_admit(&mut self) -> bool {
        let allowed = allowed_searches(self.started.elapsed(), self.events_per_second);
        if self.searches < allowed {
            self.searches += 1;
            true
        } else {
            false
        }
    }

    /// Attempts admitted so far
    pub fn searches(&self) -> u64 {
        self.searches
    }

    pub fn interval(&self) -> Duration {
        throttle_interval(self.events_per_second)
    }
}
