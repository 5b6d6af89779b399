use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Immutable description of one upstream resolver (spec.md §3, C1).
/// Bound once at configuration load and never mutated afterwards — all
/// per-upstream mutable state (metrics, health) lives alongside it in
/// `UpstreamState`, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEntry {
    /// Stable name used in logs, metrics labels, and the stats endpoint.
    pub name: String,

    pub address: SocketAddr,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default = "default_true")]
    pub health_check_enabled: bool,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub description: Option<String>,
}

fn default_weight() -> u32 {
    100
}

fn default_priority() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    2_000
}

impl UpstreamEntry {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(name: &str) -> UpstreamEntry {
        UpstreamEntry {
            name: name.into(),
            address: "127.0.0.1:53".parse().unwrap(),
            weight: default_weight(),
            priority: default_priority(),
            health_check_enabled: true,
            timeout_ms: default_timeout_ms(),
            description: None,
        }
    }

    #[test]
    fn defaults_from_serde() {
        let json = r#"{"name":"u1","address":"1.1.1.1:53"}"#;
        let u: UpstreamEntry = serde_json::from_str(json).unwrap();
        assert_eq!(u.weight, 100);
        assert_eq!(u.priority, 1);
        assert!(u.health_check_enabled);
        assert_eq!(u.timeout_ms, 2_000);
    }

    #[test]
    fn timeout_converts_millis_to_duration() {
        let u = make("u1");
        assert_eq!(u.timeout(), Duration::from_millis(2_000));
    }

    #[test]
    fn weight_and_priority_are_configurable() {
        let json = r#"{"name":"u1","address":"1.1.1.1:53","weight":500,"priority":3}"#;
        let u: UpstreamEntry = serde_json::from_str(json).unwrap();
        assert_eq!(u.weight, 500);
        assert_eq!(u.priority, 3);
    }
}
