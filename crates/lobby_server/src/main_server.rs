//! The fleet's single entry point.
//!
//! The MainServer authenticates peers against a user-supplied login
//! predicate, answers session listings, and delegates session creation to
//! its [`SessionManager`]. Clients then connect directly to the
//! session-server port returned in the creation result or listing.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{HostConfig, SessionServerOption};
use crate::error::ServerError;
use crate::server::context::{mode_from_byte, mode_to_byte, ServerContext, ServerType};
use crate::server::core::Server;
use crate::server::handler::{
    server_handler, ConnectionObserverFn, HandlerId, PacketHandlerFn, PacketObserverFn,
};
use crate::session_manager::{SessionGenerator, SessionManager, UsernameFn};
use crate::transport::{PeerId, Transport};
use waypoint_protocol::{
    create_packet, packet_type, DeliveryMode, LoginData, LoginResult, Packet,
    SessionCreationOption, SessionCreationResult, SessionListOption, SessionListResult,
};

/// User-supplied authentication predicate. On `success` with a user
/// identifier present, the peer is bound to that uid.
pub type LoginFn = Arc<dyn Fn(LoginData) -> LoginResult + Send + Sync>;

/// Entry-point server: login, session listing, and session creation.
pub struct MainServer {
    server: Server,
    manager: Arc<SessionManager>,
    login_channel: Arc<AtomicU8>,
    login_packet_mode: Arc<AtomicU8>,
}

impl MainServer {
    /// Binds the main host and installs the Login, GetSessionList, and
    /// CreateSession handlers. The same transport provisions the
    /// session-server fleet on demand.
    pub fn new(
        login_fn: LoginFn,
        username_fn: UsernameFn,
        option: SessionServerOption,
        transport: Arc<dyn Transport>,
        config: &HostConfig,
    ) -> Result<Self, ServerError> {
        let server = Server::new(ServerType::Main, transport.as_ref(), config)?;
        let manager = Arc::new(SessionManager::new(option, username_fn, transport));
        let login_channel = Arc::new(AtomicU8::new(0));
        let login_packet_mode = Arc::new(AtomicU8::new(mode_to_byte(DeliveryMode::Reliable)));

        {
            let login_channel = login_channel.clone();
            let login_packet_mode = login_packet_mode.clone();
            server.register_packet_handler(
                packet_type::LOGIN,
                server_handler::<LoginData, _>(move |ctx, peer, data| {
                    let result = login_fn(data);
                    if result.success {
                        if let Some(user) = &result.user_identifier {
                            ctx.set_peer_uid(peer, user.user_id);
                            info!(port = ctx.port(), "🔐 user logged in (uid: {})", user.user_id);
                        }
                    }

                    let mode = mode_from_byte(login_packet_mode.load(Ordering::Relaxed));
                    match create_packet(packet_type::LOGIN, &result, mode, None) {
                        Ok(packet) => {
                            ctx.send_packet(peer, login_channel.load(Ordering::Relaxed), packet)
                        }
                        Err(e) => error!("failed to encode login reply: {e}"),
                    }
                }),
            );
        }

        {
            let manager = manager.clone();
            server.register_packet_handler(
                packet_type::GET_SESSION_LIST,
                server_handler::<SessionListOption, _>(move |ctx, peer, option| {
                    let result = manager.session_list(&option);
                    match create_packet(
                        packet_type::GET_SESSION_LIST,
                        &result,
                        ctx.session_packet_mode(),
                        None,
                    ) {
                        Ok(packet) => ctx.send_packet(peer, ctx.session_channel(), packet),
                        Err(e) => error!("failed to encode session list reply: {e}"),
                    }
                }),
            );
        }

        {
            let manager = manager.clone();
            server.register_packet_handler(
                packet_type::CREATE_SESSION,
                server_handler::<SessionCreationOption, _>(move |ctx, peer, option| {
                    let result = manager.create_session(&option);
                    match create_packet(
                        packet_type::CREATE_SESSION,
                        &result,
                        ctx.session_packet_mode(),
                        None,
                    ) {
                        Ok(packet) => ctx.send_packet(peer, ctx.session_channel(), packet),
                        Err(e) => error!("failed to encode session creation reply: {e}"),
                    }
                }),
            );
        }

        Ok(Self {
            server,
            manager,
            login_channel,
            login_packet_mode,
        })
    }

    /// Registers the generator invoked for creation requests of
    /// `session_type`.
    pub fn register_session_generator(&self, session_type: &str, generator: SessionGenerator) {
        self.manager.register_session_generator(session_type, generator);
    }

    pub fn remove_session_generator(&self, session_type: &str) {
        self.manager.remove_session_generator(session_type);
    }

    /// Creates and places a session without going over the wire.
    pub fn create_session(&self, option: &SessionCreationOption) -> SessionCreationResult {
        self.manager.create_session(option)
    }

    /// Fleet-wide session listing without going over the wire.
    pub fn session_list(&self, option: &SessionListOption) -> SessionListResult {
        self.manager.session_list(option)
    }

    /// The session manager owning the fleet.
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Channel login replies go out on.
    pub fn login_channel(&self) -> u8 {
        self.login_channel.load(Ordering::Relaxed)
    }

    pub fn set_login_channel(&self, channel: u8) {
        self.login_channel.store(channel, Ordering::Relaxed);
    }

    /// Delivery mode for login replies.
    pub fn login_packet_mode(&self) -> DeliveryMode {
        mode_from_byte(self.login_packet_mode.load(Ordering::Relaxed))
    }

    pub fn set_login_packet_mode(&self, mode: DeliveryMode) {
        self.login_packet_mode
            .store(mode_to_byte(mode), Ordering::Relaxed);
    }

    /// Observer replayed onto every future session-server.
    pub fn on_session_server_connect(&self, observer: Arc<ConnectionObserverFn>) -> HandlerId {
        self.manager.on_session_server_connect(observer)
    }

    pub fn remove_session_server_connect(&self, id: HandlerId) -> bool {
        self.manager.remove_session_server_connect(id)
    }

    pub fn on_session_server_disconnect(&self, observer: Arc<ConnectionObserverFn>) -> HandlerId {
        self.manager.on_session_server_disconnect(observer)
    }

    pub fn remove_session_server_disconnect(&self, id: HandlerId) -> bool {
        self.manager.remove_session_server_disconnect(id)
    }

    pub fn on_session_server_packet(&self, observer: Arc<PacketObserverFn>) -> HandlerId {
        self.manager.on_session_server_packet(observer)
    }

    pub fn remove_session_server_packet(&self, id: HandlerId) -> bool {
        self.manager.remove_session_server_packet(id)
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        self.server.context()
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn set_timeout(&self, timeout_ms: u32) {
        self.server.set_timeout(timeout_ms);
    }

    pub fn register_packet_handler(&self, type_id: u16, handler: Arc<PacketHandlerFn>) -> bool {
        self.server.register_packet_handler(type_id, handler)
    }

    pub fn register_packet_handler_by_name(
        &self,
        type_name: &str,
        handler: Arc<PacketHandlerFn>,
    ) -> bool {
        self.server.register_packet_handler_by_name(type_name, handler)
    }

    pub fn on_connect(&self, observer: Arc<ConnectionObserverFn>) -> HandlerId {
        self.server.on_connect(observer)
    }

    pub fn on_disconnect(&self, observer: Arc<ConnectionObserverFn>) -> HandlerId {
        self.server.on_disconnect(observer)
    }

    pub fn on_packet(&self, observer: Arc<PacketObserverFn>) -> HandlerId {
        self.server.on_packet(observer)
    }

    pub fn send_packet(&self, peer: PeerId, channel: u8, packet: Packet) {
        self.server.send_packet(peer, channel, packet);
    }

    pub fn send_packet_to_uid(&self, uid: u64, channel: u8, packet: Packet) {
        self.server.send_packet_to_uid(uid, channel, packet);
    }

    pub fn peer_uid(&self, peer: PeerId) -> Option<u64> {
        self.server.peer_uid(peer)
    }

    pub fn peer_by_uid(&self, uid: u64) -> Option<PeerId> {
        self.server.peer_by_uid(uid)
    }

    /// Stops this server and every session-server in the fleet.
    pub async fn stop(&self) {
        self.server.stop().await;
        self.manager.stop_all().await;
    }

    /// Blocks until the main event worker exits.
    pub async fn wait(&self) {
        self.server.wait().await;
    }
}
