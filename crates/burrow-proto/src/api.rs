//! JSON bodies exchanged with the broker's HTTP API

use serde::{Deserialize, Serialize};

/// Returned by `GET /?new` and `GET /<id>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub id: String,
    /// Public URL under which the tunnel is reachable
    pub url: String,
    /// Always 0: tunnels are not bound to a dedicated public port
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub max_conn_count: usize,
}

/// Error body for rejected requests (e.g. `403` on an invalid identifier)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Process memory figures reported by `GET /api/status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub rss: u64,
    pub vsz: u64,
}

/// Returned by `GET /api/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStatus {
    pub tunnels: usize,
    #[serde(default)]
    pub pending: usize,
    #[serde(default)]
    pub proxyable: usize,
    pub mem: MemoryStats,
}

/// Returned by `GET /api/tunnels/<id>/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub connected_sockets: usize,
    pub connected: bool,
    /// `host:port` of the last registered target, if any
    pub target: Option<String>,
}
