//! Integration tests for the read-only admin HTTP surface.
//!
//! Uses `tower::ServiceExt::oneshot` to call the router without binding a
//! real TCP port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use flatdns_admin::server::{build_admin_router, AdminState};
use flatdns_cache::cache::TtlCache;
use flatdns_core::config::HealthCheckConfig;
use flatdns_core::metrics_window::MetricsWindow;
use flatdns_core::upstream::UpstreamEntry;
use flatdns_observability::metrics::MetricsCollector;
use flatdns_proxy::client::{ClientResult, UpstreamClient};
use flatdns_proxy::health::HealthMonitor;
use hickory_proto::op::Message;
use tower::ServiceExt; // .oneshot()

struct NeverQueriedClient;

#[async_trait]
impl UpstreamClient for NeverQueriedClient {
    async fn query(
        &self,
        _upstream: &UpstreamEntry,
        _metrics: &MetricsWindow,
        _question: &Message,
        _deadline: Duration,
    ) -> ClientResult {
        ClientResult::Timeout
    }
}

fn upstream(name: &str) -> UpstreamEntry {
    UpstreamEntry {
        name: name.into(),
        address: "127.0.0.1:53".parse().unwrap(),
        weight: 100,
        priority: 1,
        health_check_enabled: true,
        timeout_ms: 500,
        description: None,
    }
}

fn make_state() -> Arc<AdminState> {
    let health = Arc::new(HealthMonitor::new(
        vec![upstream("u1"), upstream("u2")],
        HealthCheckConfig {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 2,
            failure_threshold: 3,
            recovery_threshold: 2,
            startup_grace_secs: 10,
        },
        Arc::new(NeverQueriedClient),
    ));
    let cache = Arc::new(TtlCache::new(1024, Duration::from_secs(30)));
    let metrics = Arc::new(MetricsCollector::new().unwrap());
    Arc::new(AdminState { health, cache, metrics })
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_check_returns_200() {
    let app = build_admin_router(make_state());
    let resp = app.oneshot(get_req("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn metrics_endpoint_returns_ok() {
    let app = build_admin_router(make_state());
    let resp = app.oneshot(get_req("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn debug_upstreams_lists_every_configured_upstream() {
    let app = build_admin_router(make_state());
    let resp = app.oneshot(get_req("/debug/upstreams")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let j = body_json(resp).await;
    assert_eq!(j["total"], 2);
    assert_eq!(j["upstreams"][0]["name"], "u1");
    assert_eq!(j["upstreams"][1]["name"], "u2");
}

#[tokio::test]
async fn debug_upstreams_reports_unknown_health_before_any_probe() {
    let app = build_admin_router(make_state());
    let resp = app.oneshot(get_req("/debug/upstreams")).await.unwrap();
    let j = body_json(resp).await;
    assert_eq!(j["upstreams"][0]["health"], "Unknown");
    assert_eq!(j["upstreams"][0]["sample_count"], 0);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let app = build_admin_router(make_state());
    let resp = app.oneshot(get_req("/apisix/admin/routes")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
