use hickory_proto::op::ResponseCode;
use thiserror::Error;

/// Unified error type for flatdns.
#[derive(Error, Debug)]
pub enum FlatDnsError {
    #[error("config error: {0}")]
    Config(String),

    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream {upstream} timed out after {timeout_ms}ms")]
    UpstreamTimeout { upstream: String, timeout_ms: u64 },

    #[error("upstream {upstream} network error: {source}")]
    UpstreamNetwork {
        upstream: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("cache full, skipping insert")]
    CacheFull,

    #[error("no healthy upstream available")]
    NoHealthyUpstream,

    #[error("recursion limit reached resolving {0}")]
    RecursionLimit(String),

    #[error("CNAME loop detected resolving {0}")]
    CnameLoop(String),

    #[error(transparent)]
    Proto(#[from] hickory_proto::ProtoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl FlatDnsError {
    /// Map to the RCODE that should be synthesized into the client-facing
    /// response when this error terminates a resolution.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            FlatDnsError::Malformed(_) => ResponseCode::FormErr,
            FlatDnsError::UpstreamTimeout { .. }
            | FlatDnsError::UpstreamNetwork { .. }
            | FlatDnsError::NoHealthyUpstream
            | FlatDnsError::RecursionLimit(_)
            | FlatDnsError::CnameLoop(_) => ResponseCode::ServFail,
            _ => ResponseCode::ServFail,
        }
    }

    /// Whether this error should ever terminate the process. None of these
    /// variants do — persistent upstream failure is expressed via health
    /// state and SERVFAIL responses, never a panic or process exit.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, FlatDnsError::Config(_) | FlatDnsError::Bind { .. })
    }
}
