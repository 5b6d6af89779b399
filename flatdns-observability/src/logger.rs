use chrono::Utc;
use flatdns_core::config::QueryLogConfig;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, error};

/// Optional remote query-log push — a true no-op when disabled: no
/// channel, no task, `log()` is a branch-predicted early return.
pub struct QueryLogExporter {
    sender: Option<mpsc::Sender<serde_json::Value>>,
}

impl QueryLogExporter {
    pub fn new(config: QueryLogConfig) -> Self {
        if !config.enabled {
            return Self { sender: None };
        }

        let (tx, rx) = mpsc::channel(10_000);
        tokio::spawn(Self::flush_loop(config, rx));
        Self { sender: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { sender: None }
    }

    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub fn log(
        &self,
        client_ip: &str,
        qname: &str,
        qtype: &str,
        response_code: &str,
        cache_hit: bool,
        upstream: Option<&str>,
        latency_ms: f64,
    ) {
        let Some(sender) = &self.sender else {
            return;
        };
        let entry = json!({
            "_msg": format!("{} {} {} {} {:.2}ms", client_ip, qname, qtype, response_code, latency_ms),
            "_time": Utc::now().to_rfc3339(),
            "client_ip": client_ip,
            "qname": qname,
            "qtype": qtype,
            "response_code": response_code,
            "cache_hit": cache_hit,
            "upstream": upstream,
            "latency_ms": latency_ms,
        });
        let _ = sender.try_send(entry);
    }

    async fn flush_loop(config: QueryLogConfig, mut rx: mpsc::Receiver<serde_json::Value>) {
        let client = reqwest::Client::new();
        let mut batch: Vec<serde_json::Value> = Vec::with_capacity(config.batch_size);
        let mut flush_interval = interval(Duration::from_secs(config.flush_interval_secs));

        loop {
            tokio::select! {
                Some(entry) = rx.recv() => {
                    batch.push(entry);
                    if batch.len() >= config.batch_size {
                        Self::flush(&client, &config.endpoint, &mut batch).await;
                    }
                }
                _ = flush_interval.tick() => {
                    if !batch.is_empty() {
                        Self::flush(&client, &config.endpoint, &mut batch).await;
                    }
                }
            }
        }
    }

    async fn flush(client: &reqwest::Client, endpoint: &str, batch: &mut Vec<serde_json::Value>) {
        if batch.is_empty() {
            return;
        }
        let mut body = String::new();
        for entry in batch.iter() {
            body.push_str(&serde_json::to_string(entry).unwrap_or_default());
            body.push('\n');
        }
        let count = batch.len();
        match client
            .post(endpoint)
            .header("Content-Type", "application/stream+json")
            .body(body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                debug!(count, "flushed query log batch");
            }
            Ok(resp) => {
                error!(status = %resp.status(), "query log push failed");
            }
            Err(e) => {
                error!(error = %e, "query log connection error");
            }
        }
        batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_config() -> QueryLogConfig {
        QueryLogConfig {
            enabled: false,
            endpoint: "http://localhost:9428/insert/jsonline".to_string(),
            batch_size: 100,
            flush_interval_secs: 5,
        }
    }

    fn enabled_config() -> QueryLogConfig {
        QueryLogConfig {
            enabled: true,
            ..disabled_config()
        }
    }

    #[test]
    fn disabled_constructor_has_no_sender() {
        let exporter = QueryLogExporter::disabled();
        assert!(exporter.sender.is_none());
    }

    #[test]
    fn new_with_disabled_config_has_no_sender() {
        let exporter = QueryLogExporter::new(disabled_config());
        assert!(exporter.sender.is_none());
    }

    #[test]
    fn log_on_disabled_does_not_panic() {
        let exporter = QueryLogExporter::disabled();
        exporter.log("127.0.0.1", "example.com.", "A", "NOERROR", true, None, 0.5);
    }

    #[tokio::test]
    async fn new_with_enabled_config_has_sender() {
        let exporter = QueryLogExporter::new(enabled_config());
        assert!(exporter.sender.is_some());
    }

    #[tokio::test]
    async fn log_on_enabled_does_not_block() {
        let exporter = QueryLogExporter::new(enabled_config());
        exporter.log(
            "10.0.0.1",
            "cdn.example.net.",
            "AAAA",
            "NOERROR",
            false,
            Some("primary"),
            12.3,
        );
        tokio::time::sleep(tokio::time::Duration::from_millis(1)).await;
    }
}
