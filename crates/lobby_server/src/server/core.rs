//! The evented server base.
//!
//! A [`Server`] owns one transport host and one event worker. The worker
//! drains host events and fans them out: connection and disconnection
//! observers, raw packet observers, then typed packet handlers keyed by the
//! decoded header's type id. Everything dispatches in registration order,
//! and everything for one server runs on that server's worker, so handlers
//! never race each other within a server.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::HostConfig;
use crate::error::ServerError;
use crate::server::context::{ServerContext, ServerType};
use crate::server::handler::{
    next_handler_id, ConnectionObserverFn, HandlerId, PacketHandlerFn, PacketObserverFn,
    server_handler_raw,
};
use crate::transport::{Host, HostEvent, PeerId, Transport};
use waypoint_protocol::{
    create_packet, packet_type, packet_type_id, parse_packet, DeliveryMode, Packet,
};

/// Default transport service timeout in milliseconds.
const DEFAULT_SERVICE_TIMEOUT_MS: u32 = 50;

#[derive(Default)]
struct Registries {
    packet_handlers: RwLock<HashMap<u16, Vec<Arc<PacketHandlerFn>>>>,
    connect_observers: RwLock<BTreeMap<HandlerId, Arc<ConnectionObserverFn>>>,
    disconnect_observers: RwLock<BTreeMap<HandlerId, Arc<ConnectionObserverFn>>>,
    packet_observers: RwLock<BTreeMap<HandlerId, Arc<PacketObserverFn>>>,
}

/// One listening server: a transport host, its event worker, and the
/// handler registries. Main and session servers are built by composing
/// this base with their fixed handlers.
pub struct Server {
    ctx: Arc<ServerContext>,
    registries: Arc<Registries>,
    running: Arc<AtomicBool>,
    timeout_ms: Arc<AtomicU32>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Creates the host and starts the event worker.
    ///
    /// The fixed GetServerType handler is registered before any event can be
    /// dispatched. Host creation failure is fatal and surfaces here.
    pub fn new(
        server_type: ServerType,
        transport: &dyn Transport,
        config: &HostConfig,
    ) -> Result<Self, ServerError> {
        let host = transport.create_host(config)?;
        let ctx = Arc::new(ServerContext::new(server_type, host.port(), host.sender()));
        let registries = Arc::new(Registries::default());
        let running = Arc::new(AtomicBool::new(true));
        let timeout_ms = Arc::new(AtomicU32::new(DEFAULT_SERVICE_TIMEOUT_MS));

        let worker = tokio::spawn(run_event_loop(
            host,
            ctx.clone(),
            registries.clone(),
            running.clone(),
            timeout_ms.clone(),
        ));

        let server = Self {
            ctx,
            registries,
            running,
            timeout_ms,
            worker: Mutex::new(Some(worker)),
        };

        server.register_packet_handler(
            packet_type::GET_SERVER_TYPE,
            server_handler_raw(|ctx, peer| {
                let name = ctx.server_type().as_str().to_string();
                match create_packet(packet_type::GET_SERVER_TYPE, &name, DeliveryMode::Reliable, None)
                {
                    Ok(packet) => ctx.send_packet(peer, 0, packet),
                    Err(e) => error!("failed to encode server type reply: {e}"),
                }
            }),
        );

        Ok(server)
    }

    /// The context shared with handlers and sessions.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn server_type(&self) -> ServerType {
        self.ctx.server_type()
    }

    pub fn port(&self) -> u16 {
        self.ctx.port()
    }

    /// Transport service timeout for the event worker.
    pub fn set_timeout(&self, timeout_ms: u32) {
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    /// Appends a handler for a packet type id. The same handler instance is
    /// rejected when already registered for that id.
    pub fn register_packet_handler(&self, type_id: u16, handler: Arc<PacketHandlerFn>) -> bool {
        let mut map = self
            .registries
            .packet_handlers
            .write()
            .expect("handler registry poisoned");
        let list = map.entry(type_id).or_default();
        if list.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
            return false;
        }
        list.push(handler);
        true
    }

    /// By-name variant of [`register_packet_handler`]; fails for
    /// unregistered names.
    ///
    /// [`register_packet_handler`]: Server::register_packet_handler
    pub fn register_packet_handler_by_name(
        &self,
        type_name: &str,
        handler: Arc<PacketHandlerFn>,
    ) -> bool {
        match packet_type_id(type_name) {
            Some(type_id) => self.register_packet_handler(type_id, handler),
            None => false,
        }
    }

    /// Removes the first registration equal to `handler` for the type id.
    pub fn remove_packet_handler(&self, type_id: u16, handler: &Arc<PacketHandlerFn>) -> bool {
        let mut map = self
            .registries
            .packet_handlers
            .write()
            .expect("handler registry poisoned");
        let Some(list) = map.get_mut(&type_id) else {
            return false;
        };
        match list.iter().position(|existing| Arc::ptr_eq(existing, handler)) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn remove_packet_handler_by_name(
        &self,
        type_name: &str,
        handler: &Arc<PacketHandlerFn>,
    ) -> bool {
        match packet_type_id(type_name) {
            Some(type_id) => self.remove_packet_handler(type_id, handler),
            None => false,
        }
    }

    /// Registers a connection observer; observers run in registration order.
    pub fn on_connect(&self, observer: Arc<ConnectionObserverFn>) -> HandlerId {
        let id = next_handler_id();
        self.registries
            .connect_observers
            .write()
            .expect("observer registry poisoned")
            .insert(id, observer);
        id
    }

    pub fn remove_connect_observer(&self, id: HandlerId) -> bool {
        self.registries
            .connect_observers
            .write()
            .expect("observer registry poisoned")
            .remove(&id)
            .is_some()
    }

    /// Registers a disconnection observer.
    pub fn on_disconnect(&self, observer: Arc<ConnectionObserverFn>) -> HandlerId {
        let id = next_handler_id();
        self.registries
            .disconnect_observers
            .write()
            .expect("observer registry poisoned")
            .insert(id, observer);
        id
    }

    pub fn remove_disconnect_observer(&self, id: HandlerId) -> bool {
        self.registries
            .disconnect_observers
            .write()
            .expect("observer registry poisoned")
            .remove(&id)
            .is_some()
    }

    /// Registers a raw packet observer, invoked before typed dispatch.
    pub fn on_packet(&self, observer: Arc<PacketObserverFn>) -> HandlerId {
        let id = next_handler_id();
        self.registries
            .packet_observers
            .write()
            .expect("observer registry poisoned")
            .insert(id, observer);
        id
    }

    pub fn remove_packet_observer(&self, id: HandlerId) -> bool {
        self.registries
            .packet_observers
            .write()
            .expect("observer registry poisoned")
            .remove(&id)
            .is_some()
    }

    pub fn send_packet(&self, peer: PeerId, channel: u8, packet: Packet) {
        self.ctx.send_packet(peer, channel, packet);
    }

    pub fn send_packet_to_uid(&self, uid: u64, channel: u8, packet: Packet) {
        self.ctx.send_packet_to_uid(uid, channel, packet);
    }

    pub fn set_peer_uid(&self, peer: PeerId, uid: u64) {
        self.ctx.set_peer_uid(peer, uid);
    }

    pub fn remove_peer_uid(&self, peer: PeerId) -> bool {
        self.ctx.remove_peer_uid(peer)
    }

    pub fn remove_peer(&self, uid: u64) -> bool {
        self.ctx.remove_peer(uid)
    }

    pub fn peer_uid(&self, peer: PeerId) -> Option<u64> {
        self.ctx.peer_uid(peer)
    }

    pub fn peer_by_uid(&self, uid: u64) -> Option<PeerId> {
        self.ctx.peer_by_uid(uid)
    }

    /// Stops the event worker and waits for it to exit.
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            self.join_worker().await;
        }
    }

    /// Waits for the event worker to exit without asking it to stop.
    pub async fn wait(&self) {
        self.join_worker().await;
    }

    async fn join_worker(&self) {
        let handle = {
            let mut worker = self.worker.lock().expect("worker handle poisoned");
            worker.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_event_loop(
    mut host: Box<dyn Host>,
    ctx: Arc<ServerContext>,
    registries: Arc<Registries>,
    running: Arc<AtomicBool>,
    timeout_ms: Arc<AtomicU32>,
) {
    info!(
        server = %ctx.server_type(),
        port = ctx.port(),
        "🚀 server started"
    );

    while running.load(Ordering::Relaxed) {
        let timeout = Duration::from_millis(u64::from(timeout_ms.load(Ordering::Relaxed)));
        if let Some(event) = host.service(timeout).await {
            dispatch_event(&ctx, &registries, event);
        }
    }

    info!(
        server = %ctx.server_type(),
        port = ctx.port(),
        "server stopped"
    );
}

fn dispatch_event(ctx: &ServerContext, registries: &Registries, event: HostEvent) {
    match event {
        HostEvent::Connect(peer) => {
            let observers: Vec<_> = registries
                .connect_observers
                .read()
                .expect("observer registry poisoned")
                .values()
                .cloned()
                .collect();
            for observer in observers {
                observer(ctx, peer);
            }
            info!(
                server = %ctx.server_type(),
                port = ctx.port(),
                "🔗 client connected: {peer}"
            );
        }
        HostEvent::Receive { peer, data } => {
            let observers: Vec<_> = registries
                .packet_observers
                .read()
                .expect("observer registry poisoned")
                .values()
                .cloned()
                .collect();
            for observer in observers {
                observer(ctx, peer, &data);
            }

            // Undecodable frames were already shown to the observers; they
            // are dropped here without reaching typed handlers.
            if let Some(parsed) = parse_packet(&data) {
                let handlers: Vec<_> = registries
                    .packet_handlers
                    .read()
                    .expect("handler registry poisoned")
                    .get(&parsed.header.type_id)
                    .cloned()
                    .unwrap_or_default();
                for handler in handlers {
                    handler(ctx, peer, &parsed.payload);
                }
            }
        }
        HostEvent::Disconnect(peer) => {
            let observers: Vec<_> = registries
                .disconnect_observers
                .read()
                .expect("observer registry poisoned")
                .values()
                .cloned()
                .collect();
            for observer in observers {
                observer(ctx, peer);
            }
            info!(
                server = %ctx.server_type(),
                port = ctx.port(),
                "❌ client disconnected: {peer}"
            );
        }
    }
}
