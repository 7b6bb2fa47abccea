use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub active_count: usize,
    pub error_count: u64,
    pub error_rate: f64,
}

/// Active-connection and error counters shared by the registry and read loops
#[derive(Debug, Default)]
pub struct StatsAggregator {
    active: AtomicUsize,
    errors: AtomicU64,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::AcqRel);
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Acquire)
    }

    /// errors / (active + errors). Mixes two unrelated counts, so treat it
    /// as a rough health indicator rather than a per-operation failure rate.
    pub fn error_rate(&self) -> f64 {
        let errors = self.error_count() as f64;
        let denominator = self.active_count() as f64 + errors;
        if denominator == 0.0 {
            0.0
        } else {
            errors / denominator
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_count: self.active_count(),
            error_count: self.error_count(),
            error_rate: self.error_rate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats() {
        let stats = StatsAggregator::new();
        assert_eq!(stats.snapshot(), StatsSnapshot { active_count: 0, error_count: 0, error_rate: 0.0 });
    }

    #[test]
    fn test_error_rate_formula() {
        let stats = StatsAggregator::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_opened();
        stats.record_error();
        assert_eq!(stats.error_rate(), 0.25);
    }

    #[test]
    fn test_close_never_underflows() {
        let stats = StatsAggregator::new();
        stats.connection_closed();
        assert_eq!(stats.active_count(), 0);
        stats.connection_opened();
        stats.connection_closed();
        stats.connection_closed();
        assert_eq!(stats.active_count(), 0);
    }
}
