//! In-process loopback transport.
//!
//! Hosts bind to ports in a shared in-memory hub; clients connect through
//! the same hub and exchange frames over channels. Deterministic and
//! dependency-free, which makes it the transport of choice for tests.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::HostConfig;
use crate::error::ServerError;
use crate::transport::{Host, HostEvent, HostSender, PeerId, Transport};
use waypoint_protocol::{DeliveryMode, Packet};

struct MemoryHostShared {
    port: u16,
    max_peers: usize,
    events_tx: mpsc::Sender<HostEvent>,
    /// server → client delivery channels, keyed by peer
    peers: DashMap<PeerId, mpsc::UnboundedSender<(u8, Bytes)>>,
    next_peer: AtomicU64,
}

struct MemoryHub {
    hosts: DashMap<u16, Arc<MemoryHostShared>>,
}

/// Loopback transport; every host and client created from one instance
/// shares the same port namespace.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(MemoryHub {
                hosts: DashMap::new(),
            }),
        }
    }
}

impl Transport for MemoryTransport {
    fn create_host(&self, config: &HostConfig) -> Result<Box<dyn Host>, ServerError> {
        let (events_tx, events_rx) = mpsc::channel(config.queue_size.max(1));
        let shared = Arc::new(MemoryHostShared {
            port: config.port,
            max_peers: config.max_peers,
            events_tx,
            peers: DashMap::new(),
            next_peer: AtomicU64::new(1),
        });

        let entry = self.hub.hosts.entry(config.port);
        match entry {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ServerError::HostCreation(format!(
                "port {} already bound",
                config.port
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(shared.clone());
                Ok(Box::new(MemoryHost {
                    hub: self.hub.clone(),
                    shared,
                    events_rx,
                }))
            }
        }
    }
}

struct MemoryHost {
    hub: Arc<MemoryHub>,
    shared: Arc<MemoryHostShared>,
    events_rx: mpsc::Receiver<HostEvent>,
}

impl Drop for MemoryHost {
    fn drop(&mut self) {
        self.hub.hosts.remove(&self.shared.port);
    }
}

#[async_trait]
impl Host for MemoryHost {
    async fn service(&mut self, timeout: Duration) -> Option<HostEvent> {
        match tokio::time::timeout(timeout, self.events_rx.recv()).await {
            Ok(event) => event,
            Err(_) => None,
        }
    }

    fn sender(&self) -> Arc<dyn HostSender> {
        Arc::new(MemoryHostSender {
            shared: self.shared.clone(),
        })
    }

    fn port(&self) -> u16 {
        self.shared.port
    }

    fn peer_addr(&self, _peer: PeerId) -> Option<SocketAddr> {
        None
    }
}

struct MemoryHostSender {
    shared: Arc<MemoryHostShared>,
}

impl HostSender for MemoryHostSender {
    fn send(&self, peer: PeerId, channel: u8, data: Bytes, _mode: DeliveryMode) -> bool {
        match self.shared.peers.get(&peer) {
            Some(tx) => tx.send((channel, data)).is_ok(),
            None => false,
        }
    }
}

/// Client endpoint connected to a loopback host.
pub struct MemoryClient {
    peer: PeerId,
    shared: Arc<MemoryHostShared>,
    inbound: mpsc::UnboundedReceiver<(u8, Bytes)>,
}

impl MemoryClient {
    /// Connects to the host bound to `port` on this transport's hub.
    pub async fn connect(transport: &MemoryTransport, port: u16) -> Result<Self, ServerError> {
        let shared = transport
            .hub
            .hosts
            .get(&port)
            .map(|entry| entry.clone())
            .ok_or_else(|| ServerError::Transport(format!("no host bound to port {port}")))?;

        if shared.peers.len() >= shared.max_peers {
            return Err(ServerError::Transport(format!(
                "host on port {port} is full"
            )));
        }

        let peer = PeerId(shared.next_peer.fetch_add(1, Ordering::Relaxed));
        let (tx, inbound) = mpsc::unbounded_channel();
        shared.peers.insert(peer, tx);
        shared
            .events_tx
            .send(HostEvent::Connect(peer))
            .await
            .map_err(|_| ServerError::Transport("host is gone".to_string()))?;

        Ok(Self {
            peer,
            shared,
            inbound,
        })
    }

    /// Peer id the host assigned to this client.
    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    /// Delivers an encoded packet to the host. The inbound loopback path
    /// carries no channel, mirroring how the servers consume receive
    /// events.
    pub async fn send(&self, _channel: u8, packet: &Packet) -> Result<(), ServerError> {
        self.shared
            .events_tx
            .send(HostEvent::Receive {
                peer: self.peer,
                data: packet.bytes.clone(),
            })
            .await
            .map_err(|_| ServerError::Transport("host is gone".to_string()))
    }

    /// Waits up to `timeout` for the next packet from the host.
    pub async fn recv(&mut self, timeout: Duration) -> Option<(u8, Bytes)> {
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(frame) => frame,
            Err(_) => None,
        }
    }

    /// Disconnects from the host, surfacing a disconnect event there.
    pub async fn disconnect(self) {
        self.shared.peers.remove(&self.peer);
        let _ = self
            .shared
            .events_tx
            .send(HostEvent::Disconnect(self.peer))
            .await;
    }
}
