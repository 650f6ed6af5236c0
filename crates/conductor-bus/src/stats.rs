//! Bus statistics.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Number of recent deliveries averaged for latency.
pub const LATENCY_WINDOW: usize = 1000;

/// Snapshot of bus counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub total_sent: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    pub total_expired: u64,
    pub dead_letter_count: usize,
    /// Requests still waiting for a response.
    pub in_flight_count: usize,
    pub active_subscriptions: usize,
    /// Mean delivery latency over the last [`LATENCY_WINDOW`] deliveries.
    pub avg_delivery_ms: f64,
}

/// Rolling window of delivery latencies.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    total: Duration,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            total: Duration::ZERO,
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, sample: Duration) {
        self.samples.push_back(sample);
        self.total += sample;
        while self.samples.len() > self.capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.total -= evicted;
            }
        }
    }

    pub fn average_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.total.as_secs_f64() * 1000.0 / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.total = Duration::ZERO;
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(LATENCY_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average() {
        let mut window = LatencyWindow::new(10);
        assert_eq!(window.average_ms(), 0.0);

        window.record(Duration::from_millis(10));
        window.record(Duration::from_millis(30));
        assert!((window.average_ms() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut window = LatencyWindow::new(2);
        window.record(Duration::from_millis(100));
        window.record(Duration::from_millis(2));
        window.record(Duration::from_millis(4));

        assert_eq!(window.len(), 2);
        assert!((window.average_ms() - 3.0).abs() < 1e-9);
    }
}
