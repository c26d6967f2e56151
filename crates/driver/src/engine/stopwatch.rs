//! Suspendable stopwatch for billable processing time

use std::time::{Duration, Instant};

/// Measures processing time, excluding suspended stretches
///
/// The work unit starts it before calling a processor and stops it after.
/// A processor may suspend it around work it does not want billed, such as
/// waiting for a shared test fixture.
#[derive(Debug, Clone, Default)]
pub struct StopWatch {
    accumulated: Duration,
    running_since: Option<Instant>,
    started: bool,
    stopped: bool,
}

impl StopWatch {
    /// A stopwatch that has not been started
    pub fn new() -> Self {
        Self::default()
    }

    /// A stopwatch that is already running
    pub fn started() -> Self {
        let mut watch = Self::new();
        watch.start();
        watch
    }

    /// Start timing; ignored if already started
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.running_since = Some(Instant::now());
    }

    /// Pause timing; ignored unless running
    pub fn suspend(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += since.elapsed();
        }
    }

    /// Continue timing after a suspend; ignored unless suspended
    pub fn resume(&mut self) {
        if self.is_suspended() {
            self.running_since = Some(Instant::now());
        }
    }

    /// Stop timing for good
    pub fn stop(&mut self) {
        self.suspend();
        self.stopped = true;
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    pub fn is_suspended(&self) -> bool {
        self.started && !self.stopped && self.running_since.is_none()
    }

    /// Billable time so far
    pub fn elapsed(&self) -> Duration {
        match self.running_since {
            Some(since) => self.accumulated + since.elapsed(),
            None => self.accumulated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_unstarted_watch_reads_zero() {
        let watch = StopWatch::new();
        assert_eq!(watch.elapsed(), Duration::ZERO);
        assert!(!watch.is_running());
        assert!(!watch.is_suspended());
    }

    #[test]
    fn test_suspended_time_excluded() {
        let wall = Instant::now();
        let mut watch = StopWatch::started();
        sleep(Duration::from_millis(20));
        watch.suspend();
        let at_suspend = watch.elapsed();
        assert!(watch.is_suspended());

        sleep(Duration::from_millis(50));
        assert_eq!(watch.elapsed(), at_suspend);

        watch.resume();
        sleep(Duration::from_millis(20));
        watch.stop();

        let total = watch.elapsed();
        assert!(total >= Duration::from_millis(40));
        assert!(total + Duration::from_millis(50) <= wall.elapsed());
    }

    #[test]
    fn test_stop_freezes_and_resume_is_ignored() {
        let mut watch = StopWatch::started();
        watch.stop();
        let frozen = watch.elapsed();
        watch.resume();
        sleep(Duration::from_millis(5));
        assert_eq!(watch.elapsed(), frozen);
        assert!(!watch.is_running());
    }

    #[test]
    fn test_double_start_keeps_origin() {
        let mut watch = StopWatch::started();
        sleep(Duration::from_millis(10));
        watch.start();
        assert!(watch.elapsed() >= Duration::from_millis(10));
    }
}
