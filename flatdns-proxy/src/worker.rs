use std::sync::Arc;
use std::time::Duration;

use flatdns_cache::TtlCache;
use flatdns_core::config::FlatDnsConfig;
use flatdns_observability::logger::QueryLogExporter;
use flatdns_observability::metrics::MetricsCollector;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::client::DnsUpstreamClient;
use crate::frontend::{run_tcp, run_udp, DnsFrontend};
use crate::health::HealthMonitor;
use crate::rate_limit::PerIpRateLimiter;
use crate::resolver::FlatteningResolver;

/// Everything a worker task needs a handle to. Built once at startup and
/// shared by `Arc` across the listener tasks, the health-probe tasks, and
/// the admin surface.
pub struct SharedState {
    pub config: Arc<FlatDnsConfig>,
    pub cache: Arc<TtlCache>,
    pub health: Arc<HealthMonitor>,
    pub resolver: Arc<FlatteningResolver>,
    pub rate_limiter: Arc<PerIpRateLimiter>,
    pub metrics: Arc<MetricsCollector>,
    pub query_log: Arc<QueryLogExporter>,
}

impl SharedState {
    pub fn new(config: FlatDnsConfig) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);
        let cache = Arc::new(TtlCache::new(
            config.cache.max_size,
            Duration::from_secs(config.cache.cleanup_interval_secs),
        ));
        let client = Arc::new(DnsUpstreamClient::new());
        let health = Arc::new(HealthMonitor::new(
            config.upstreams.clone(),
            config.health_checks.clone(),
            client.clone(),
        ));
        let resolver = Arc::new(FlatteningResolver::new(
            Arc::clone(&cache),
            Arc::clone(&health),
            client,
            config.selection_strategy,
            config.flattener.clone(),
            config.cache.clone(),
        ));
        let rate_limiter = Arc::new(PerIpRateLimiter::new(
            config.rate_limit.per_ip,
            config.rate_limit.burst,
        ));
        let metrics = Arc::new(MetricsCollector::new()?);
        let query_log = Arc::new(QueryLogExporter::new(config.query_log.clone()));

        Ok(Arc::new(Self {
            config,
            cache,
            health,
            resolver,
            rate_limiter,
            metrics,
            query_log,
        }))
    }
}

/// Spawn the listener tasks, the health-probe scheduler, and the periodic
/// cache/rate-limiter sweep (spec.md §4.6, §5). Returns the handles so the
/// caller can await them for graceful shutdown.
pub fn spawn(shared: Arc<SharedState>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let frontend = Arc::new(DnsFrontend::new(
        Arc::clone(&shared.resolver),
        Arc::clone(&shared.health),
        shared.config.flattener.clone(),
        Arc::clone(&shared.rate_limiter),
        Arc::clone(&shared.metrics),
        Arc::clone(&shared.query_log),
    ));

    {
        let frontend = Arc::clone(&frontend);
        let listen = shared.config.listen.clone();
        let rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_udp(frontend, listen, rx).await {
                tracing::error!(error = %e, "UDP listener exited");
            }
        }));
    }

    {
        let frontend = Arc::clone(&frontend);
        let listen = shared.config.listen.clone();
        let rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_tcp(frontend, listen, rx).await {
                tracing::error!(error = %e, "TCP listener exited");
            }
        }));
    }

    if shared.config.health_checks.enabled {
        handles.extend(shared.health.start());
    }

    {
        let cache = Arc::clone(&shared.cache);
        let rate_limiter = Arc::clone(&shared.rate_limiter);
        let metrics = Arc::clone(&shared.metrics);
        let interval = Duration::from_secs(shared.config.cache.cleanup_interval_secs);
        let mut rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = rx.recv() => return,
                    _ = tick.tick() => {
                        let removed = cache.sweep(std::time::SystemTime::now());
                        rate_limiter.sweep(interval * 4);
                        metrics.cache_entries.with_label_values(&["all"]).set(cache.stats().len as i64);
                        info!(removed, "periodic cache sweep");
                    }
                }
            }
        }));
    }

    handles
}
