use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Outcome of one terminated upstream query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Timeout,
    Refused,
    ServFail,
    Error,
}

impl Outcome {
    fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    outcome: Outcome,
    latency: Duration,
}

const DEFAULT_CAPACITY: usize = 128;

/// Rolling success/failure/latency sample store for one upstream
/// (spec.md §3, C2). Mutated by the upstream client and health monitor,
/// read by the selector and stats endpoint — a short-critical-section
/// mutex per spec.md §5.
pub struct MetricsWindow {
    capacity: usize,
    samples: Mutex<VecDeque<Sample>>,
    consecutive_failures: Mutex<u32>,
    consecutive_successes: Mutex<u32>,
}

impl MetricsWindow {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            consecutive_failures: Mutex::new(0),
            consecutive_successes: Mutex::new(0),
        }
    }

    pub fn record(&self, outcome: Outcome, latency: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(Sample {
            at: Instant::now(),
            outcome,
            latency,
        });
        drop(samples);

        if outcome.is_success() {
            *self.consecutive_successes.lock() += 1;
            *self.consecutive_failures.lock() = 0;
        } else {
            *self.consecutive_failures.lock() += 1;
            *self.consecutive_successes.lock() = 0;
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        *self.consecutive_failures.lock()
    }

    pub fn consecutive_successes(&self) -> u32 {
        *self.consecutive_successes.lock()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    /// Rolling fraction of samples that succeeded, in `[0.0, 1.0]`.
    /// Returns `1.0` on an empty window so a freshly created upstream is
    /// not penalized before it has been probed.
    pub fn success_rate(&self) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return 1.0;
        }
        let successes = samples.iter().filter(|s| s.outcome.is_success()).count();
        successes as f64 / samples.len() as f64
    }

    /// Mean latency over successful samples only. `None` when there are no
    /// successful samples to average.
    pub fn mean_latency(&self) -> Option<Duration> {
        let samples = self.samples.lock();
        let successes: Vec<_> = samples.iter().filter(|s| s.outcome.is_success()).collect();
        if successes.is_empty() {
            return None;
        }
        let total: Duration = successes.iter().map(|s| s.latency).sum();
        Some(total / successes.len() as u32)
    }
}

impl Default for MetricsWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_has_full_success_rate_and_no_latency() {
        let w = MetricsWindow::new();
        assert_eq!(w.success_rate(), 1.0);
        assert_eq!(w.mean_latency(), None);
        assert_eq!(w.sample_count(), 0);
    }

    #[test]
    fn consecutive_counters_reset_on_opposite_outcome() {
        let w = MetricsWindow::new();
        w.record(Outcome::Timeout, Duration::from_millis(10));
        w.record(Outcome::Timeout, Duration::from_millis(10));
        assert_eq!(w.consecutive_failures(), 2);
        assert_eq!(w.consecutive_successes(), 0);

        w.record(Outcome::Success, Duration::from_millis(5));
        assert_eq!(w.consecutive_failures(), 0);
        assert_eq!(w.consecutive_successes(), 1);
    }

    #[test]
    fn ring_buffer_evicts_oldest_sample_past_capacity() {
        let w = MetricsWindow::with_capacity(2);
        w.record(Outcome::Success, Duration::from_millis(100));
        w.record(Outcome::Success, Duration::from_millis(100));
        w.record(Outcome::Timeout, Duration::from_millis(100));
        assert_eq!(w.sample_count(), 2);
        // the first success was evicted; one success + one failure remain
        assert_eq!(w.success_rate(), 0.5);
    }

    #[test]
    fn mean_latency_excludes_failed_samples() {
        let w = MetricsWindow::new();
        w.record(Outcome::Success, Duration::from_millis(10));
        w.record(Outcome::Success, Duration::from_millis(30));
        w.record(Outcome::Timeout, Duration::from_millis(2000));
        assert_eq!(w.mean_latency(), Some(Duration::from_millis(20)));
    }
}
