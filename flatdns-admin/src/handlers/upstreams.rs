use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::server::AdminState;

/// Read-only snapshot of configured upstreams, their live health status and
/// rolling metrics (spec.md §4.7 — observational only, must not mutate any
/// component state).
pub async fn list_upstreams(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let upstreams: Vec<Value> = state
        .health
        .entries()
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let metrics = state.health.metrics_for(i);
            json!({
                "name": entry.name,
                "address": entry.address.to_string(),
                "weight": entry.weight,
                "priority": entry.priority,
                "health_check_enabled": entry.health_check_enabled,
                "health": format!("{:?}", state.health.status_of(i)),
                "success_rate": metrics.success_rate(),
                "mean_latency_ms": metrics.mean_latency().map(|d| d.as_millis() as u64),
                "sample_count": metrics.sample_count(),
            })
        })
        .collect();

    Json(json!({ "upstreams": upstreams, "total": upstreams.len() }))
}
