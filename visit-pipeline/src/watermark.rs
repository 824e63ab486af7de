use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Event-time progress of a stream that may arrive out of order.
///
/// The watermark trails the highest event time observed by a fixed delay and
/// never moves backwards. It only depends on the event times fed to it, so
/// replaying the same events reproduces the same watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkTracker {
    delay_ms: i64,
    max_event_time: Option<i64>,
}

impl WatermarkTracker {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay_ms: duration_ms(delay),
            max_event_time: None,
        }
    }

    /// Restores a tracker from a checkpointed max event time.
    pub fn resume(delay: Duration, max_event_time: Option<i64>) -> Self {
        Self {
            delay_ms: duration_ms(delay),
            max_event_time,
        }
    }

    /// Feeds one event time, returns the watermark after it.
    pub fn observe(&mut self, event_time_ms: i64) -> Option<i64> {
        self.max_event_time = Some(match self.max_event_time {
            Some(max) => max.max(event_time_ms),
            None => event_time_ms,
        });
        self.current()
    }

    /// `None` until the first event was observed.
    pub fn current(&self) -> Option<i64> {
        self.max_event_time
            .map(|max| max.saturating_sub(self.delay_ms))
    }

    pub fn max_event_time(&self) -> Option<i64> {
        self.max_event_time
    }
}

/// Fixed-size, non-overlapping event-time windows aligned on the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TumblingWindows {
    size_ms: i64,
}

impl TumblingWindows {
    pub fn new(size: Duration) -> Self {
        Self {
            size_ms: duration_ms(size).max(1),
        }
    }

    /// Start of the window containing `event_time_ms`, also for negative times.
    pub fn window_start(&self, event_time_ms: i64) -> i64 {
        event_time_ms.div_euclid(self.size_ms) * self.size_ms
    }

    pub fn window_end(&self, window_start: i64) -> i64 {
        window_start.saturating_add(self.size_ms)
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_trails_max_event_time() {
        let mut tracker = WatermarkTracker::new(Duration::from_secs(10));
        assert_eq!(tracker.current(), None);

        assert_eq!(tracker.observe(20_000), Some(10_000));
        assert_eq!(tracker.observe(25_000), Some(15_000));
    }

    #[test]
    fn watermark_never_regresses() {
        let mut tracker = WatermarkTracker::new(Duration::from_secs(1));
        tracker.observe(50_000);

        assert_eq!(tracker.observe(1_000), Some(49_000));
        assert_eq!(tracker.max_event_time(), Some(50_000));

        let resumed = WatermarkTracker::resume(Duration::from_secs(1), tracker.max_event_time());
        assert_eq!(resumed, tracker);
    }

    #[test]
    fn tumbling_windows_align_on_size() {
        let windows = TumblingWindows::new(Duration::from_secs(5));

        assert_eq!(windows.window_start(0), 0);
        assert_eq!(windows.window_start(4_999), 0);
        assert_eq!(windows.window_start(5_000), 5_000);
        assert_eq!(windows.window_start(12_345), 10_000);
        assert_eq!(windows.window_start(-1), -5_000);
        assert_eq!(windows.window_end(10_000), 15_000);
    }
}
