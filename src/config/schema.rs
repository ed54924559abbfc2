//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! transport. All types derive Serde traits for deserialization from config
//! files, and every field has a default so minimal configs work.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for a peerwire node.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PeerwireConfig {
    /// Identity and bind address of the local node.
    pub node: NodeInfo,

    /// Transport tunables (timeouts, limits, socket options).
    pub transport: TransportConfig,
}

/// Identity and listen endpoint of a node.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeInfo {
    /// Opaque node identifier, used only for logging.
    pub id: String,

    /// Address to bind the listener on.
    pub ip: IpAddr,

    /// Port to bind the listener on (0 = ephemeral).
    pub port: u16,
}

impl NodeInfo {
    /// The socket address this node listens on.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self {
            id: "node-0".to_string(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        }
    }
}

/// Transport layer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Destroy a connection after this long without inbound bytes.
    pub inactivity_timeout_ms: u64,

    /// Bound on graceful close before falling back to abort.
    pub close_timeout_ms: u64,

    /// Bound on an outbound connect attempt.
    pub connect_timeout_ms: u64,

    /// Maximum concurrent inbound connections per listener.
    pub max_connections: usize,

    /// Enable TCP keepalive on dialed sockets.
    pub keep_alive: bool,

    /// Disable Nagle's algorithm on dialed sockets.
    pub no_delay: bool,
}

impl TransportConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            // 2 minutes without inbound bytes closes an idle socket.
            inactivity_timeout_ms: 120_000,
            close_timeout_ms: 500,
            connect_timeout_ms: 5_000,
            max_connections: 10_000,
            keep_alive: true,
            no_delay: true,
        }
    }
}
