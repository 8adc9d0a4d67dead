//! Shared server context handed to packet handlers and observers.
//!
//! The context is the non-owning face of a server: the peer↔uid table, the
//! transport sender, and the channel/mode knobs. Handlers run on the
//! server's event worker and receive `&ServerContext`; sessions keep an
//! `Arc` of it as their only link back to the hosting server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use tracing::error;

use crate::transport::{HostSender, PeerId};
use waypoint_protocol::{DeliveryMode, Packet};

/// What kind of server a context belongs to, as reported by GetServerType.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerType {
    Main,
    Session,
    #[default]
    Generic,
}

impl ServerType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerType::Main => "MAIN_SERVER",
            ServerType::Session => "SESSION_SERVER",
            ServerType::Generic => "SERVER",
        }
    }
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn mode_to_byte(mode: DeliveryMode) -> u8 {
    match mode {
        DeliveryMode::Reliable => 0,
        DeliveryMode::Unreliable => 1,
    }
}

pub(crate) fn mode_from_byte(byte: u8) -> DeliveryMode {
    match byte {
        0 => DeliveryMode::Reliable,
        _ => DeliveryMode::Unreliable,
    }
}

#[derive(Default)]
struct PeerMaps {
    peer_to_uid: HashMap<PeerId, u64>,
    uid_to_peer: HashMap<u64, PeerId>,
}

/// Bidirectional peer↔uid table.
///
/// Both directions are updated under one exclusive section, so a uid is
/// bound to at most one peer and vice versa at every observable point.
#[derive(Default)]
pub struct PeerUidTable {
    maps: RwLock<PeerMaps>,
}

impl PeerUidTable {
    /// Binds `peer` to `uid`, displacing any stale binding of either key.
    pub fn set(&self, peer: PeerId, uid: u64) {
        let mut maps = self.maps.write().expect("peer table poisoned");
        if let Some(old_uid) = maps.peer_to_uid.insert(peer, uid) {
            maps.uid_to_peer.remove(&old_uid);
        }
        if let Some(old_peer) = maps.uid_to_peer.insert(uid, peer) {
            if old_peer != peer {
                maps.peer_to_uid.remove(&old_peer);
            }
        }
    }

    /// Unbinds by peer. Returns `false` when the peer had no uid.
    pub fn remove_by_peer(&self, peer: PeerId) -> bool {
        let mut maps = self.maps.write().expect("peer table poisoned");
        match maps.peer_to_uid.remove(&peer) {
            Some(uid) => {
                maps.uid_to_peer.remove(&uid);
                true
            }
            None => false,
        }
    }

    /// Unbinds by uid. Returns `false` when the uid was not bound.
    pub fn remove_by_uid(&self, uid: u64) -> bool {
        let mut maps = self.maps.write().expect("peer table poisoned");
        match maps.uid_to_peer.remove(&uid) {
            Some(peer) => {
                maps.peer_to_uid.remove(&peer);
                true
            }
            None => false,
        }
    }

    pub fn uid(&self, peer: PeerId) -> Option<u64> {
        let maps = self.maps.read().expect("peer table poisoned");
        maps.peer_to_uid.get(&peer).copied()
    }

    pub fn peer(&self, uid: u64) -> Option<PeerId> {
        let maps = self.maps.read().expect("peer table poisoned");
        maps.uid_to_peer.get(&uid).copied()
    }
}

/// Per-server state shared between the event worker, handlers, and sessions.
pub struct ServerContext {
    server_type: ServerType,
    port: u16,
    peers: PeerUidTable,
    sender: Arc<dyn HostSender>,
    session_channel: AtomicU8,
    session_packet_mode: AtomicU8,
}

impl ServerContext {
    pub(crate) fn new(server_type: ServerType, port: u16, sender: Arc<dyn HostSender>) -> Self {
        Self {
            server_type,
            port,
            peers: PeerUidTable::default(),
            sender,
            session_channel: AtomicU8::new(0),
            session_packet_mode: AtomicU8::new(mode_to_byte(DeliveryMode::Reliable)),
        }
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Channel session-related replies go out on.
    pub fn session_channel(&self) -> u8 {
        self.session_channel.load(Ordering::Relaxed)
    }

    pub fn set_session_channel(&self, channel: u8) {
        self.session_channel.store(channel, Ordering::Relaxed);
    }

    /// Delivery mode for session-related replies.
    pub fn session_packet_mode(&self) -> DeliveryMode {
        mode_from_byte(self.session_packet_mode.load(Ordering::Relaxed))
    }

    pub fn set_session_packet_mode(&self, mode: DeliveryMode) {
        self.session_packet_mode
            .store(mode_to_byte(mode), Ordering::Relaxed);
    }

    /// Binds a peer to a uid after successful login or join.
    pub fn set_peer_uid(&self, peer: PeerId, uid: u64) {
        self.peers.set(peer, uid);
    }

    /// Removes the binding for a peer, typically on disconnect.
    pub fn remove_peer_uid(&self, peer: PeerId) -> bool {
        self.peers.remove_by_peer(peer)
    }

    /// Removes the binding for a uid.
    pub fn remove_peer(&self, uid: u64) -> bool {
        self.peers.remove_by_uid(uid)
    }

    pub fn peer_uid(&self, peer: PeerId) -> Option<u64> {
        self.peers.uid(peer)
    }

    pub fn peer_by_uid(&self, uid: u64) -> Option<PeerId> {
        self.peers.peer(uid)
    }

    /// Sends a packet to a peer. Unknown peers are logged and dropped.
    pub fn send_packet(&self, peer: PeerId, channel: u8, packet: Packet) {
        if !self.sender.send(peer, channel, packet.bytes, packet.mode) {
            error!(
                server = %self.server_type,
                port = self.port,
                "failed to send packet: unknown peer {peer}"
            );
        }
    }

    /// Sends a packet to whichever peer the uid is bound to.
    pub fn send_packet_to_uid(&self, uid: u64, channel: u8, packet: Packet) {
        match self.peer_by_uid(uid) {
            Some(peer) => self.send_packet(peer, channel, packet),
            None => error!(
                server = %self.server_type,
                port = self.port,
                "failed to send packet: no peer bound to uid {uid}"
            ),
        }
    }
}
