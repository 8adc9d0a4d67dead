//! UDP transport backend.
//!
//! A thin datagram host over `tokio::net::UdpSocket` with a one-byte control
//! protocol: peers announce themselves with CONNECT, exchange DATA frames
//! tagged with a channel and delivery mode, and leave with DISCONNECT or by
//! going silent past the peer timeout. A receiver task feeds the host's
//! event queue, an outbound task drains the send queue, and a sweep task
//! expires idle peers.
//!
//! The mode byte is carried on every frame but this backend implements no
//! retransmission; deployments that need hard reliability guarantees plug in
//! a different [`Transport`](crate::transport::Transport).

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::config::HostConfig;
use crate::error::ServerError;
use crate::transport::{Host, HostEvent, HostSender, PeerId, Transport};
use waypoint_protocol::{DeliveryMode, Packet};

const FRAME_CONNECT: u8 = 0x01;
const FRAME_CONNECT_ACK: u8 = 0x02;
const FRAME_DATA: u8 = 0x03;
const FRAME_DISCONNECT: u8 = 0x04;

const DATA_PREFIX_LEN: usize = 3;
const MAX_DATAGRAM: usize = 64 * 1024;

/// Peers idle past this duration are swept and reported disconnected.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);

fn mode_byte(mode: DeliveryMode) -> u8 {
    match mode {
        DeliveryMode::Reliable => 0,
        DeliveryMode::Unreliable => 1,
    }
}

struct UdpPeer {
    addr: SocketAddr,
    last_seen: Mutex<Instant>,
}

struct UdpHostShared {
    socket: Arc<UdpSocket>,
    port: u16,
    max_peers: usize,
    peers: DashMap<PeerId, Arc<UdpPeer>>,
    by_addr: DashMap<SocketAddr, PeerId>,
    next_peer: AtomicU64,
    events_tx: mpsc::Sender<HostEvent>,
    outbound_tx: mpsc::Sender<(SocketAddr, Bytes)>,
}

impl UdpHostShared {
    fn remove_peer(&self, peer: PeerId) -> Option<Arc<UdpPeer>> {
        let (_, state) = self.peers.remove(&peer)?;
        self.by_addr.remove(&state.addr);
        Some(state)
    }
}

/// UDP-backed [`Transport`]. Hosts bind `0.0.0.0:<port>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpTransport;

impl UdpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for UdpTransport {
    fn create_host(&self, config: &HostConfig) -> Result<Box<dyn Host>, ServerError> {
        let socket = bind_socket(config)?;
        let port = socket
            .local_addr()
            .map_err(|e| ServerError::HostCreation(e.to_string()))?
            .port();

        let (events_tx, events_rx) = mpsc::channel(config.queue_size.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_size.max(1));

        let shared = Arc::new(UdpHostShared {
            socket: Arc::new(socket),
            port,
            max_peers: config.max_peers,
            peers: DashMap::new(),
            by_addr: DashMap::new(),
            next_peer: AtomicU64::new(1),
            events_tx,
            outbound_tx,
        });

        let tasks = vec![
            tokio::spawn(receive_loop(shared.clone())),
            tokio::spawn(outbound_loop(shared.clone(), outbound_rx)),
            tokio::spawn(sweep_loop(shared.clone())),
        ];

        Ok(Box::new(UdpHost {
            shared,
            events_rx,
            tasks,
        }))
    }
}

fn bind_socket(config: &HostConfig) -> Result<UdpSocket, ServerError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| ServerError::HostCreation(e.to_string()))?;

    if let Some(bytes) = config.buffer_size.bytes() {
        socket
            .set_recv_buffer_size(bytes)
            .map_err(|e| ServerError::HostCreation(e.to_string()))?;
        socket
            .set_send_buffer_size(bytes)
            .map_err(|e| ServerError::HostCreation(e.to_string()))?;
    }

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::HostCreation(format!("bind {}: {e}", config.port)))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ServerError::HostCreation(e.to_string()))?;

    UdpSocket::from_std(socket.into()).map_err(|e| ServerError::HostCreation(e.to_string()))
}

async fn receive_loop(shared: Arc<UdpHostShared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match shared.socket.recv_from(&mut buf).await {
            Ok((len, addr)) => handle_datagram(&shared, &buf[..len], addr).await,
            Err(e) => {
                error!("udp receive error on port {}: {e}", shared.port);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn handle_datagram(shared: &Arc<UdpHostShared>, datagram: &[u8], addr: SocketAddr) {
    let Some(&kind) = datagram.first() else {
        return;
    };

    match kind {
        FRAME_CONNECT => {
            if shared.by_addr.contains_key(&addr) {
                // Duplicate handshake; the first ack may have been lost.
                let _ = shared
                    .outbound_tx
                    .send((addr, Bytes::from_static(&[FRAME_CONNECT_ACK])))
                    .await;
                return;
            }
            if shared.peers.len() >= shared.max_peers {
                warn!("rejecting connection from {addr}: host on port {} is full", shared.port);
                return;
            }

            let peer = PeerId(shared.next_peer.fetch_add(1, Ordering::Relaxed));
            let state = Arc::new(UdpPeer {
                addr,
                last_seen: Mutex::new(Instant::now()),
            });
            shared.peers.insert(peer, state);
            shared.by_addr.insert(addr, peer);

            let _ = shared
                .outbound_tx
                .send((addr, Bytes::from_static(&[FRAME_CONNECT_ACK])))
                .await;
            let _ = shared.events_tx.send(HostEvent::Connect(peer)).await;
        }
        FRAME_DATA => {
            let Some(peer) = shared.by_addr.get(&addr).map(|entry| *entry) else {
                trace!("dropping data from unconnected {addr}");
                return;
            };
            if datagram.len() < DATA_PREFIX_LEN {
                return;
            }
            if let Some(state) = shared.peers.get(&peer) {
                *state.last_seen.lock().expect("peer clock poisoned") = Instant::now();
            }
            let data = Bytes::copy_from_slice(&datagram[DATA_PREFIX_LEN..]);
            let _ = shared.events_tx.send(HostEvent::Receive { peer, data }).await;
        }
        FRAME_DISCONNECT => {
            if let Some(peer) = shared.by_addr.get(&addr).map(|entry| *entry) {
                shared.remove_peer(peer);
                let _ = shared.events_tx.send(HostEvent::Disconnect(peer)).await;
            }
        }
        other => debug!("ignoring unknown frame kind {other:#x} from {addr}"),
    }
}

async fn outbound_loop(
    shared: Arc<UdpHostShared>,
    mut outbound_rx: mpsc::Receiver<(SocketAddr, Bytes)>,
) {
    while let Some((addr, bytes)) = outbound_rx.recv().await {
        if let Err(e) = shared.socket.send_to(&bytes, addr).await {
            error!("udp send to {addr} failed: {e}");
        }
    }
}

async fn sweep_loop(shared: Arc<UdpHostShared>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;

        let expired: Vec<PeerId> = shared
            .peers
            .iter()
            .filter(|entry| {
                entry
                    .last_seen
                    .lock()
                    .expect("peer clock poisoned")
                    .elapsed()
                    > PEER_TIMEOUT
            })
            .map(|entry| *entry.key())
            .collect();

        for peer in expired {
            if let Some(state) = shared.remove_peer(peer) {
                debug!("peer {peer} at {} timed out", state.addr);
                let _ = shared
                    .outbound_tx
                    .send((state.addr, Bytes::from_static(&[FRAME_DISCONNECT])))
                    .await;
                let _ = shared.events_tx.send(HostEvent::Disconnect(peer)).await;
            }
        }
    }
}

struct UdpHost {
    shared: Arc<UdpHostShared>,
    events_rx: mpsc::Receiver<HostEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for UdpHost {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl Host for UdpHost {
    async fn service(&mut self, timeout: Duration) -> Option<HostEvent> {
        match tokio::time::timeout(timeout, self.events_rx.recv()).await {
            Ok(event) => event,
            Err(_) => None,
        }
    }

    fn sender(&self) -> Arc<dyn HostSender> {
        Arc::new(UdpHostSender {
            shared: self.shared.clone(),
        })
    }

    fn port(&self) -> u16 {
        self.shared.port
    }

    fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.shared.peers.get(&peer).map(|state| state.addr)
    }
}

struct UdpHostSender {
    shared: Arc<UdpHostShared>,
}

impl HostSender for UdpHostSender {
    fn send(&self, peer: PeerId, channel: u8, data: Bytes, mode: DeliveryMode) -> bool {
        let Some(addr) = self.shared.peers.get(&peer).map(|state| state.addr) else {
            return false;
        };

        let mut frame = BytesMut::with_capacity(DATA_PREFIX_LEN + data.len());
        frame.put_u8(FRAME_DATA);
        frame.put_u8(channel);
        frame.put_u8(mode_byte(mode));
        frame.put_slice(&data);

        self.shared.outbound_tx.try_send((addr, frame.freeze())).is_ok()
    }
}

/// Minimal client for the UDP backend, used by demos and tests.
pub struct UdpClient {
    socket: UdpSocket,
}

impl UdpClient {
    /// Connects to a UDP host, retrying the handshake a few times.
    pub async fn connect(server: SocketAddr) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| ServerError::Transport(e.to_string()))?;
        socket
            .connect(server)
            .await
            .map_err(|e| ServerError::Transport(e.to_string()))?;

        let mut buf = [0u8; 16];
        for _ in 0..5 {
            socket
                .send(&[FRAME_CONNECT])
                .await
                .map_err(|e| ServerError::Transport(e.to_string()))?;

            match tokio::time::timeout(Duration::from_millis(200), socket.recv(&mut buf)).await {
                Ok(Ok(len)) if len >= 1 && buf[0] == FRAME_CONNECT_ACK => {
                    return Ok(Self { socket });
                }
                _ => continue,
            }
        }

        Err(ServerError::Transport(format!(
            "no handshake ack from {server}"
        )))
    }

    /// Sends an encoded packet on `channel`.
    pub async fn send(&self, channel: u8, packet: &Packet) -> Result<(), ServerError> {
        let mut frame = BytesMut::with_capacity(DATA_PREFIX_LEN + packet.bytes.len());
        frame.put_u8(FRAME_DATA);
        frame.put_u8(channel);
        frame.put_u8(mode_byte(packet.mode));
        frame.put_slice(&packet.bytes);

        self.socket
            .send(&frame)
            .await
            .map(|_| ())
            .map_err(|e| ServerError::Transport(e.to_string()))
    }

    /// Waits up to `timeout` for the next data frame from the server.
    pub async fn recv(&self, timeout: Duration) -> Option<(u8, Bytes)> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
            match tokio::time::timeout(remaining, self.socket.recv(&mut buf)).await {
                Ok(Ok(len)) if len >= DATA_PREFIX_LEN && buf[0] == FRAME_DATA => {
                    return Some((buf[1], Bytes::copy_from_slice(&buf[DATA_PREFIX_LEN..len])));
                }
                Ok(Ok(_)) => continue, // control frame; keep waiting for data
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }

    /// Tells the server this client is leaving.
    pub async fn disconnect(self) {
        let _ = self.socket.send(&[FRAME_DISCONNECT]).await;
    }
}
