//! Electrum client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol versions offered during negotiation, newest first.
pub const DEFAULT_PROTOCOL_VERSIONS: [&str; 3] = ["1.4", "1.2", "1.1"];

/// Connection and retry settings for [`ChainDataClient`](crate::ChainDataClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectrumConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Skip certificate verification. Electrum servers are commonly
    /// self-signed.
    pub accept_invalid_certs: bool,
    /// TCP connect and TLS handshake limit.
    pub connect_timeout_secs: u64,
    /// Limit on one request/response exchange, independent of connect.
    pub operation_timeout_secs: u64,
    /// Limit on each `server.version` attempt.
    pub negotiation_timeout_secs: u64,
    /// Attempts per request, each a full connect-negotiate-request cycle.
    pub max_retries: u32,
    /// Base backoff; attempt `n` waits `reconnect_interval * 2^n`.
    pub reconnect_interval_secs: u64,
    pub max_requests_per_second: u32,
    /// A connection idle for longer than this is pinged before reuse.
    /// Zero pings before every reuse.
    pub liveness_idle_secs: u64,
    pub protocol_versions: Vec<String>,
    pub client_name: String,
}

impl Default for ElectrumConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 50002,
            use_tls: true,
            accept_invalid_certs: true,
            connect_timeout_secs: 30,
            operation_timeout_secs: 60,
            negotiation_timeout_secs: 10,
            max_retries: 3,
            reconnect_interval_secs: 1,
            max_requests_per_second: 10,
            liveness_idle_secs: 0,
            protocol_versions: DEFAULT_PROTOCOL_VERSIONS.iter().map(|v| v.to_string()).collect(),
            client_name: concat!("glacier/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ElectrumConfig {
    /// Plain-TCP configuration for a local server (typically a regtest
    /// electrs on port 50001).
    pub fn local_plaintext(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            use_tls: false,
            ..Self::default()
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn liveness_idle(&self) -> Duration {
        Duration::from_secs(self.liveness_idle_secs)
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }
}
