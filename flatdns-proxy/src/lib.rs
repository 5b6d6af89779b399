pub mod client;
pub mod frontend;
pub mod health;
pub mod rate_limit;
pub mod resolver;
pub mod worker;

pub use client::{ClientResult, DnsUpstreamClient, UpstreamClient};
pub use frontend::DnsFrontend;
pub use health::HealthMonitor;
pub use rate_limit::PerIpRateLimiter;
pub use resolver::{FlatteningResolver, ResolveOutcome};
pub use worker::SharedState;
