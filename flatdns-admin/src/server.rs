use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router as AxumRouter;
use flatdns_cache::cache::TtlCache;
use flatdns_core::config::AdminConfig;
use flatdns_observability::metrics::MetricsCollector;
use flatdns_proxy::health::HealthMonitor;
use tracing::info;

use crate::handlers;

/// Shared state for the read-only admin surface (spec.md §4.7). Every
/// handler reads through these Arcs; none of them hold a mutator.
pub struct AdminState {
    pub health: Arc<HealthMonitor>,
    pub cache: Arc<TtlCache>,
    pub metrics: Arc<MetricsCollector>,
}

/// Build the Axum router with the three observational admin routes.
/// Exposed standalone (no bound listener) so tests can drive it with
/// `tower::ServiceExt::oneshot`.
pub fn build_admin_router(state: Arc<AdminState>) -> AxumRouter {
    AxumRouter::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(metrics_handler))
        .route("/debug/upstreams", get(handlers::upstreams::list_upstreams))
        .with_state(state)
}

async fn metrics_handler(State(state): State<Arc<AdminState>>) -> String {
    state.metrics.gather_text()
}

/// Admin HTTP server lifecycle wrapper.
pub struct AdminServer {
    config: AdminConfig,
    state: Arc<AdminState>,
}

impl AdminServer {
    pub fn new(config: AdminConfig, state: Arc<AdminState>) -> Self {
        Self { config, state }
    }

    pub async fn start(self) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!("admin API disabled");
            return Ok(());
        }

        let addr = self.config.addr;
        let app = build_admin_router(self.state);

        info!(addr = %addr, "starting admin API server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
