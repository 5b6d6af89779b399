use std::net::SocketAddr;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::selector::SelectionStrategy;
use crate::upstream::UpstreamEntry;

/// Top-level configuration for flatdns (spec.md §6 "configuration surface").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatDnsConfig {
    /// Instance id, surfaced in logs and the stats endpoint.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub listen: ListenConfig,

    pub upstreams: Vec<UpstreamEntry>,

    #[serde(default)]
    pub selection_strategy: SelectionStrategy,

    #[serde(default)]
    pub health_checks: HealthCheckConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default, rename = "cname-flattener")]
    pub flattener: FlattenerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub query_log: QueryLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_addr")]
    pub udp_addr: SocketAddr,

    #[serde(default = "default_listen_addr")]
    pub tcp_addr: SocketAddr,

    /// TCP connection idle timeout — spec.md §9 leaves this
    /// implementation-defined; 10s is the conservative default it suggests.
    #[serde(default = "default_tcp_idle_timeout_secs")]
    pub tcp_idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,

    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    #[serde(default = "default_cache_default_ttl")]
    pub default_ttl: u32,

    #[serde(default = "default_cache_min_ttl")]
    pub min_ttl: u32,

    #[serde(default = "default_cache_max_ttl")]
    pub max_ttl: u32,

    #[serde(default = "default_max_negative_ttl")]
    pub max_negative_ttl: u32,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlattenerConfig {
    #[serde(default = "default_max_recursion")]
    pub max_recursion: usize,

    #[serde(default)]
    pub remove_aaaa: bool,

    #[serde(default = "default_max_upstream_retries")]
    pub max_upstream_retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_per_ip")]
    pub per_ip: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_addr")]
    pub addr: SocketAddr,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Optional remote push of structured per-query logs. Disabled by default;
/// when disabled the exporter is a true no-op (no channel, no task).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_query_log_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_query_log_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_query_log_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            udp_addr: default_listen_addr(),
            tcp_addr: default_listen_addr(),
            tcp_idle_timeout_secs: default_tcp_idle_timeout_secs(),
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            timeout_secs: default_probe_timeout_secs(),
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            startup_grace_secs: default_startup_grace_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            default_ttl: default_cache_default_ttl(),
            min_ttl: default_cache_min_ttl(),
            max_ttl: default_cache_max_ttl(),
            max_negative_ttl: default_max_negative_ttl(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl Default for FlattenerConfig {
    fn default() -> Self {
        Self {
            max_recursion: default_max_recursion(),
            remove_aaaa: false,
            max_upstream_retries: default_max_upstream_retries(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_ip: default_rate_limit_per_ip(),
            burst: default_rate_limit_burst(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            addr: default_admin_addr(),
            enabled: true,
        }
    }
}

impl Default for QueryLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_query_log_endpoint(),
            batch_size: default_query_log_batch_size(),
            flush_interval_secs: default_query_log_flush_interval_secs(),
        }
    }
}

impl FlatDnsConfig {
    /// Load configuration from a YAML file (explicit path, or the first of
    /// the default search locations) plus `FLATDNS_`-prefixed environment
    /// overrides, `__`-split for nesting — mirrors the teacher's
    /// `AndoConfig::load`.
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["flatdns.yaml", "/etc/flatdns/flatdns.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("FLATDNS_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:53".parse().unwrap()
}

fn default_tcp_idle_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    10
}

fn default_probe_timeout_secs() -> u64 {
    2
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_threshold() -> u32 {
    2
}

fn default_startup_grace_secs() -> u64 {
    5
}

fn default_cache_max_size() -> usize {
    100_000
}

fn default_cache_default_ttl() -> u32 {
    300
}

fn default_cache_min_ttl() -> u32 {
    0
}

fn default_cache_max_ttl() -> u32 {
    86_400
}

fn default_max_negative_ttl() -> u32 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_max_recursion() -> usize {
    16
}

fn default_max_upstream_retries() -> usize {
    2
}

fn default_rate_limit_per_ip() -> u32 {
    50
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn default_admin_addr() -> SocketAddr {
    "127.0.0.1:9353".parse().unwrap()
}

fn default_query_log_endpoint() -> String {
    "http://localhost:9428/insert/jsonline".to_string()
}

fn default_query_log_batch_size() -> usize {
    100
}

fn default_query_log_flush_interval_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cache = CacheConfig::default();
        assert_eq!(cache.max_ttl, 86_400);
        let hc = HealthCheckConfig::default();
        assert_eq!(hc.failure_threshold, 3);
        assert_eq!(hc.recovery_threshold, 2);
        assert_eq!(hc.startup_grace_secs, 5);
        let rl = RateLimitConfig::default();
        assert_eq!(rl.per_ip, 50);
        assert_eq!(rl.burst, 100);
    }

    #[test]
    fn listen_defaults_to_port_53_both_transports() {
        let listen = ListenConfig::default();
        assert_eq!(listen.udp_addr.port(), 53);
        assert_eq!(listen.tcp_addr.port(), 53);
        assert_eq!(listen.tcp_idle_timeout_secs, 10);
    }

    #[test]
    fn full_config_parses_from_yaml() {
        let yaml = r#"
upstreams:
  - name: primary
    address: "1.1.1.1:53"
  - name: secondary
    address: "8.8.8.8:53"
    weight: 50
selection_strategy: failover
cname-flattener:
  remove_aaaa: true
"#;
        let figment = Figment::new().merge(Yaml::string(yaml));
        let cfg: FlatDnsConfig = figment.extract().unwrap();
        assert_eq!(cfg.upstreams.len(), 2);
        assert_eq!(cfg.upstreams[1].weight, 50);
        assert!(cfg.flattener.remove_aaaa);
        assert_eq!(cfg.selection_strategy, SelectionStrategy::Failover);
    }
}
