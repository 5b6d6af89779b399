pub mod config;
pub mod error;
pub mod health;
pub mod metrics_window;
pub mod model;
pub mod selector;
pub mod upstream;

pub use config::FlatDnsConfig;
pub use error::FlatDnsError;
pub use health::{HealthState, HealthStatus};
pub use metrics_window::{MetricsWindow, Outcome};
pub use model::{CacheEntry, CacheKind, QueryKey, RR};
pub use selector::{Candidate, SelectionStrategy, SelectorState};
pub use upstream::UpstreamEntry;
