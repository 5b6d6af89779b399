use std::sync::Arc;
use std::time::{Duration, Instant};

use flatdns_core::config::HealthCheckConfig;
use flatdns_core::health::{HealthState, HealthStatus};
use flatdns_core::metrics_window::MetricsWindow;
use flatdns_core::upstream::UpstreamEntry;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::{root_soa_probe, ClientResult, UpstreamClient};

/// Scheduled prober that maintains per-upstream health state with
/// hysteresis (spec.md §4.2, C5 — the I/O half; the pure transition logic
/// lives in `flatdns_core::health`).
pub struct HealthMonitor {
    entries: Vec<UpstreamEntry>,
    states: Vec<Arc<HealthState>>,
    metrics: Vec<Arc<MetricsWindow>>,
    config: HealthCheckConfig,
    client: Arc<dyn UpstreamClient>,
    process_start: Instant,
}

impl HealthMonitor {
    pub fn new(
        entries: Vec<UpstreamEntry>,
        config: HealthCheckConfig,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        let states = entries.iter().map(|_| Arc::new(HealthState::new())).collect();
        let metrics = entries.iter().map(|_| Arc::new(MetricsWindow::new())).collect();
        Self {
            entries,
            states,
            metrics,
            config,
            client,
            process_start: Instant::now(),
        }
    }

    pub fn entries(&self) -> &[UpstreamEntry] {
        &self.entries
    }

    pub fn metrics_for(&self, index: usize) -> &Arc<MetricsWindow> {
        &self.metrics[index]
    }

    pub fn status_of(&self, index: usize) -> HealthStatus {
        self.states[index].status()
    }

    fn in_grace_period(&self) -> bool {
        self.process_start.elapsed() < Duration::from_secs(self.config.startup_grace_secs)
    }

    /// The healthy subset for selection (spec.md §4.2 `HealthyFor`):
    /// upstreams in `Healthy` or (while warming up) `Unknown`, plus any
    /// upstream with health checking disabled (always considered healthy).
    /// Falls back to the full configured set when that subset is empty.
    pub fn healthy_indices(&self) -> Vec<usize> {
        let in_grace = self.in_grace_period();
        let mut healthy: Vec<usize> = (0..self.entries.len())
            .filter(|&i| {
                if !self.entries[i].health_check_enabled {
                    return true;
                }
                let status = self.states[i].status();
                status == HealthStatus::Healthy || (status == HealthStatus::Unknown && in_grace)
            })
            .collect();

        if healthy.is_empty() {
            warn!("no healthy upstream remains; degraded fallback to full configured set");
            healthy = (0..self.entries.len()).collect();
        }
        healthy
    }

    /// Re-evaluate transitions for `index` using whatever consecutive
    /// counters its metrics window currently holds. Called both by the
    /// scheduled probe loop and, per spec.md §4.2's Healthy→Unhealthy row,
    /// after every live query outcome.
    pub fn reevaluate(&self, index: usize) {
        if !self.entries[index].health_check_enabled {
            return;
        }
        let metrics = &self.metrics[index];
        let in_grace = self.in_grace_period();
        if let Some((from, to)) = self.states[index].apply(
            metrics.consecutive_failures(),
            metrics.consecutive_successes(),
            self.config.failure_threshold,
            self.config.recovery_threshold,
            in_grace,
        ) {
            info!(
                upstream = %self.entries[index].name,
                from = ?from,
                to = ?to,
                "upstream health transition"
            );
        }
    }

    async fn probe_once(&self, index: usize) {
        let upstream = &self.entries[index];
        let metrics = &self.metrics[index];
        let question = root_soa_probe();
        let timeout = Duration::from_secs(self.config.timeout_secs);

        // client.query() already classifies the RCODE and records the
        // sample; spec.md §4.2 treats any well-formed NoError/NXDomain
        // reply as a probe success, which matches that classification for
        // every code except the two failure modes routed through
        // Outcome::Timeout/Outcome::Error/Outcome::ServFail/Outcome::Refused
        // above, so the recorded consecutive counters already reflect it.
        let _ = self.client.query(upstream, metrics, &question, timeout).await;
        self.reevaluate(index);
    }

    /// Spawn one probe loop per health-check-enabled upstream. Returns the
    /// handles so the caller can abort them on shutdown.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for index in 0..self.entries.len() {
            if !self.entries[index].health_check_enabled {
                continue;
            }
            let monitor = Arc::clone(self);
            let interval = Duration::from_secs(monitor.config.interval_secs);
            handles.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tick.tick().await;
                    monitor.probe_once(index).await;
                }
            }));
        }
        handles
    }
}
