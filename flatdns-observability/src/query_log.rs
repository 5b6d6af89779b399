use serde::{Deserialize, Serialize};

/// Structured per-query log entry (spec.md leaves query logging
/// implementation-defined; this is the shape pushed to the optional
/// remote sink by [`crate::logger::QueryLogExporter`]).
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub timestamp: String,
    pub client_ip: String,
    pub qname: String,
    pub qtype: String,
    pub response_code: String,
    pub cache_hit: bool,
    pub upstream: Option<String>,
    pub latency_ms: f64,
}
