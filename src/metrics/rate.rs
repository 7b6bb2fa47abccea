use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Bytes observed over one reporting window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSample {
    pub bytes_in_window: u64,
    pub window_seconds: f64,
}

impl RateSample {
    pub fn rate(&self) -> Option<f64> {
        if self.window_seconds > 0.0 {
            Some(self.bytes_in_window as f64 / self.window_seconds)
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct RateWindow {
    last_tick: Instant,
    last_rate: f64,
}

/// Bytes-per-second over the interval between reporting ticks.
///
/// `record` is called from the read loop and only touches atomics; `tick`
/// is driven by whoever reports (roughly once a second).
#[derive(Debug)]
pub struct RateEstimator {
    pending: AtomicU64,
    total: AtomicU64,
    window: Mutex<RateWindow>,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self {
            pending: AtomicU64::new(0),
            total: AtomicU64::new(0),
            window: Mutex::new(RateWindow {
                last_tick: start,
                last_rate: 0.0,
            }),
        }
    }

    pub fn record(&self, bytes: usize) {
        self.pending.fetch_add(bytes as u64, Ordering::Relaxed);
        self.total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes recorded since creation
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn last_rate(&self) -> f64 {
        self.lock_window().last_rate
    }

    pub fn tick(&self) -> f64 {
        self.tick_at(Instant::now())
    }

    /// Close the current window at `now`. A window with no measurable
    /// elapsed time keeps the counter and reports the previous rate.
    pub fn tick_at(&self, now: Instant) -> f64 {
        let mut window = self.lock_window();
        let elapsed = now.saturating_duration_since(window.last_tick).as_secs_f64();

        let sample = RateSample {
            bytes_in_window: self.pending.load(Ordering::Relaxed),
            window_seconds: elapsed,
        };
        if sample.rate().is_some() {
            let bytes = self.pending.swap(0, Ordering::Relaxed);
            window.last_rate = bytes as f64 / elapsed;
            window.last_tick = now;
        }
        window.last_rate
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, RateWindow> {
        self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_over_two_seconds() {
        let start = Instant::now();
        let rate = RateEstimator::starting_at(start);
        rate.record(600);
        rate.record(400);
        assert_eq!(rate.tick_at(start + Duration::from_secs(2)), 500.0);
        assert_eq!(rate.total(), 1000);
    }

    #[test]
    fn test_counter_resets_each_tick() {
        let start = Instant::now();
        let rate = RateEstimator::starting_at(start);
        rate.record(100);
        assert_eq!(rate.tick_at(start + Duration::from_secs(1)), 100.0);
        assert_eq!(rate.tick_at(start + Duration::from_secs(2)), 0.0);
        assert_eq!(rate.total(), 100);
    }

    #[test]
    fn test_zero_elapsed_returns_previous_rate() {
        let start = Instant::now();
        let rate = RateEstimator::starting_at(start);
        rate.record(300);
        let t1 = start + Duration::from_secs(3);
        assert_eq!(rate.tick_at(t1), 100.0);

        rate.record(50);
        assert_eq!(rate.tick_at(t1), 100.0);
        // Bytes from the zero-length window carry into the next one
        assert_eq!(rate.tick_at(t1 + Duration::from_secs(1)), 50.0);
    }

    #[test]
    fn test_sample_rate_guard() {
        let empty = RateSample { bytes_in_window: 10, window_seconds: 0.0 };
        assert_eq!(empty.rate(), None);
        let full = RateSample { bytes_in_window: 10, window_seconds: 4.0 };
        assert_eq!(full.rate(), Some(2.5));
    }
}
