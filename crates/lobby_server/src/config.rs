//! Fleet and host configuration types.

use serde::{Deserialize, Serialize};
use waypoint_protocol::BufferSize;

/// Configuration for the session-server fleet, fed once to the main server.
///
/// `max_sessions` caps both the live sessions per session-server and the
/// number of session-servers the manager will provision; the k-th server
/// ever provisioned listens on `port_range.0 + k`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionServerOption {
    /// Maximum concurrent peers per session-server host
    pub max_connections: usize,

    /// Number of transport channels per host
    pub max_channels: usize,

    /// Per-server session cap, doubling as the fleet size cap
    pub max_sessions: u16,

    /// Ports session-servers are provisioned from, low to high inclusive
    pub port_range: (u16, u16),

    /// Transport event/outbound queue depth
    pub queue_size: usize,

    /// Incoming bandwidth budget in bytes/s (0 = unlimited)
    pub incoming_bandwidth: u32,

    /// Outgoing bandwidth budget in bytes/s (0 = unlimited)
    pub outgoing_bandwidth: u32,

    /// Socket buffer sizing preset
    pub buffer_size: BufferSize,
}

impl Default for SessionServerOption {
    fn default() -> Self {
        Self {
            max_connections: 64,
            max_channels: 8,
            max_sessions: 16,
            port_range: (6000, 6015),
            queue_size: 1024,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            buffer_size: BufferSize::Default,
        }
    }
}

impl SessionServerOption {
    /// Host parameters for a session-server on the given port.
    pub fn host_config(&self, port: u16) -> HostConfig {
        HostConfig {
            port,
            max_peers: self.max_connections,
            max_channels: self.max_channels,
            queue_size: self.queue_size,
            incoming_bandwidth: self.incoming_bandwidth,
            outgoing_bandwidth: self.outgoing_bandwidth,
            buffer_size: self.buffer_size,
        }
    }
}

/// Parameters for creating a single transport host.
#[derive(Debug, Clone, Copy)]
pub struct HostConfig {
    pub port: u16,
    pub max_peers: usize,
    pub max_channels: usize,
    pub queue_size: usize,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub buffer_size: BufferSize,
}

impl HostConfig {
    /// A host on `port` with the default limits.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            max_peers: 64,
            max_channels: 8,
            queue_size: 1024,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            buffer_size: BufferSize::Default,
        }
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }
}
