//! Transport abstraction consumed by the server core.
//!
//! A [`Host`] is one listening endpoint with connected peers. The owning
//! server's event worker is the only caller of [`Host::service`]; everything
//! else talks to the host through its cloneable [`HostSender`], which
//! enqueues outbound packets without blocking. A [`Transport`] creates
//! hosts, which lets the session manager provision new session-servers and
//! lets tests swap the UDP stack for the in-process loopback.

pub mod memory;
pub mod udp;

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::HostConfig;
use crate::error::ServerError;
use waypoint_protocol::DeliveryMode;

pub use memory::{MemoryClient, MemoryTransport};
pub use udp::{UdpClient, UdpTransport};

/// Opaque handle to a connected peer, unique per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Event surfaced by a host's service loop.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A peer completed the transport handshake
    Connect(PeerId),
    /// A peer delivered one packet frame
    Receive { peer: PeerId, data: Bytes },
    /// A peer disconnected or timed out
    Disconnect(PeerId),
}

/// One listening endpoint. Serviced by exactly one worker.
#[async_trait]
pub trait Host: Send {
    /// Waits up to `timeout` for the next event. `None` means nothing is
    /// pending; the worker is free to check its running flag and poll again.
    async fn service(&mut self, timeout: Duration) -> Option<HostEvent>;

    /// Cloneable handle for enqueueing outbound packets.
    fn sender(&self) -> Arc<dyn HostSender>;

    /// Port the host is bound to.
    fn port(&self) -> u16;

    /// Remote address of a connected peer, when the backend has one.
    fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr>;
}

/// Non-blocking outbound path of a host.
pub trait HostSender: Send + Sync {
    /// Enqueues `data` for `peer` on `channel`. Returns `false` when the
    /// peer is unknown or the outbound queue rejected the packet.
    fn send(&self, peer: PeerId, channel: u8, data: Bytes, mode: DeliveryMode) -> bool;
}

/// Factory for hosts. Implementations must be callable from within a tokio
/// runtime: host creation spawns the transport's I/O tasks.
pub trait Transport: Send + Sync {
    fn create_host(&self, config: &HostConfig) -> Result<Box<dyn Host>, ServerError>;
}
