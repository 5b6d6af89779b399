use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Pure hysteresis transition (spec.md §4.2). Given the current status and
/// the consecutive-failure/success counts already recorded in the metrics
/// window, decide the next status. `in_grace_period` suppresses any
/// transition into `Unhealthy` during the startup grace window.
pub fn next_status(
    current: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    failure_threshold: u32,
    recovery_threshold: u32,
    in_grace_period: bool,
) -> HealthStatus {
    match current {
        HealthStatus::Unknown => {
            if consecutive_successes >= 1 {
                HealthStatus::Healthy
            } else if !in_grace_period && consecutive_failures >= failure_threshold {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Unknown
            }
        }
        HealthStatus::Healthy => {
            if !in_grace_period && consecutive_failures >= failure_threshold {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Healthy
            }
        }
        HealthStatus::Unhealthy => {
            if consecutive_successes >= recovery_threshold {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            }
        }
    }
}

/// Per-upstream health state (spec.md §3). Transitions are driven
/// exclusively by the health monitor; the selector and stats endpoint only
/// ever read `status()`.
pub struct HealthState {
    inner: Mutex<Inner>,
}

struct Inner {
    status: HealthStatus,
    last_transition: Instant,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: HealthStatus::Unknown,
                last_transition: Instant::now(),
            }),
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.lock().status
    }

    pub fn last_transition(&self) -> Instant {
        self.inner.lock().last_transition
    }

    /// Apply the pure transition function and, if the status actually
    /// changes, stamp `last_transition`. Returns `Some((from, to))` on a
    /// real transition, `None` otherwise.
    pub fn apply(
        &self,
        consecutive_failures: u32,
        consecutive_successes: u32,
        failure_threshold: u32,
        recovery_threshold: u32,
        in_grace_period: bool,
    ) -> Option<(HealthStatus, HealthStatus)> {
        let mut inner = self.inner.lock();
        let next = next_status(
            inner.status,
            consecutive_failures,
            consecutive_successes,
            failure_threshold,
            recovery_threshold,
            in_grace_period,
        );
        if next == inner.status {
            return None;
        }
        let from = inner.status;
        inner.status = next;
        inner.last_transition = Instant::now();
        Some((from, next))
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}
