//! Session-hosting server.
//!
//! A SessionServer runs many independent sessions in a slot-addressed table;
//! the slot index doubles as the session number clients join by. Incoming
//! packets that are not framework traffic are routed to the session the
//! sending peer's uid is bound to. Sessions are detached automatically when
//! their last member leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::HostConfig;
use crate::error::ServerError;
use crate::server::context::{mode_from_byte, mode_to_byte, ServerContext, ServerType};
use crate::server::core::Server;
use crate::server::handler::{
    server_handler, ConnectionObserverFn, HandlerId, PacketHandlerFn, PacketObserverFn,
};
use crate::session::{spawn_tick_loop, Session};
use crate::transport::{PeerId, Transport};
use waypoint_protocol::{
    create_packet, packet_type, parse_packet, DeliveryMode, Packet, SessionIdentifier,
    SessionInfo, SessionJoinOption, SessionJoinResult,
};

/// Error code for joins rejected by validation.
pub const ERROR_INVALID_JOIN: u8 = 1;

#[derive(Default)]
struct SessionTables {
    slots: Vec<Option<Arc<dyn Session>>>,
    tasks: Vec<Option<JoinHandle<()>>>,
    uid_to_session: HashMap<u64, u16>,
    session_members: HashMap<u16, Vec<u64>>,
}

struct SessionServerInner {
    port: u16,
    join_packet_mode: AtomicU8,
    tables: Mutex<SessionTables>,
}

impl SessionServerInner {
    fn join_packet_mode(&self) -> DeliveryMode {
        mode_from_byte(self.join_packet_mode.load(Ordering::Relaxed))
    }

    /// Join policy: the slot must host a live session, the password must
    /// match, and the session must have room.
    fn validate_join(&self, option: &SessionJoinOption) -> Result<(), &'static str> {
        let tables = self.tables.lock().expect("session tables poisoned");
        let Some(Some(session)) = tables.slots.get(option.session_number as usize) else {
            return Err("no such session");
        };

        let core = session.core();
        if !core.compare_password(option.password.as_deref().unwrap_or("")) {
            return Err("wrong password");
        }
        let info = core.info();
        if info.current_players >= info.max_players {
            return Err("session is full");
        }
        Ok(())
    }

    fn add_user(&self, session_number: u16, uid: u64) {
        let mut tables = self.tables.lock().expect("session tables poisoned");
        tables.uid_to_session.insert(uid, session_number);
        tables
            .session_members
            .entry(session_number)
            .or_default()
            .push(uid);
        if let Some(Some(session)) = tables.slots.get(session_number as usize) {
            session.core().add_member(uid);
        }
    }

    /// Removes a user from its session; detaches the session when it was
    /// the last member.
    fn remove_user(&self, uid: u64) -> bool {
        let mut tables = self.tables.lock().expect("session tables poisoned");
        let Some(session_number) = tables.uid_to_session.remove(&uid) else {
            return false;
        };

        if let Some(Some(session)) = tables.slots.get(session_number as usize) {
            session.core().remove_member(uid);
        }

        let emptied = match tables.session_members.get_mut(&session_number) {
            Some(members) => {
                members.retain(|member| *member != uid);
                members.is_empty()
            }
            None => false,
        };

        if emptied {
            tables.session_members.remove(&session_number);
            Self::detach_slot(&mut tables, session_number, self.port);
        }
        true
    }

    fn session_number_by_uid(&self, uid: u64) -> Option<u16> {
        let tables = self.tables.lock().expect("session tables poisoned");
        tables.uid_to_session.get(&uid).copied()
    }

    fn session(&self, session_number: u16) -> Option<Arc<dyn Session>> {
        let tables = self.tables.lock().expect("session tables poisoned");
        tables
            .slots
            .get(session_number as usize)
            .and_then(Clone::clone)
    }

    fn detach_slot(tables: &mut SessionTables, session_number: u16, port: u16) -> bool {
        let slot = session_number as usize;
        let Some(session) = tables.slots.get_mut(slot).and_then(Option::take) else {
            error!(port, "failed to detach session: slot {session_number} is not live");
            return false;
        };

        session.core().stop();
        // Dropping the task handle abandons the loop; it exits at the next
        // running check, within one tick interval.
        if let Some(task) = tables.tasks.get_mut(slot) {
            task.take();
        }
        info!(port, "🗑️ session detached (slot {session_number})");
        true
    }
}

/// One server instance hosting up to `max_sessions` sessions of one type.
pub struct SessionServer {
    server: Server,
    inner: Arc<SessionServerInner>,
}

impl SessionServer {
    /// Binds the host and installs the fixed join handler, the disconnect
    /// cleanup observer, and the per-session routing observer.
    pub fn new(transport: &dyn Transport, config: &HostConfig) -> Result<Self, ServerError> {
        let server = Server::new(ServerType::Session, transport, config)?;
        let inner = Arc::new(SessionServerInner {
            port: server.port(),
            join_packet_mode: AtomicU8::new(mode_to_byte(DeliveryMode::Reliable)),
            tables: Mutex::new(SessionTables::default()),
        });

        let join_inner = inner.clone();
        server.register_packet_handler(
            packet_type::JOIN_SESSION,
            server_handler::<SessionJoinOption, _>(move |ctx, peer, option| {
                let uid = option.user_identifier.user_id;
                let result = match join_inner.validate_join(&option) {
                    Ok(()) => {
                        ctx.set_peer_uid(peer, uid);
                        join_inner.add_user(option.session_number, uid);
                        info!(
                            port = ctx.port(),
                            "👤 user joined (uid: {uid}, slot: {})", option.session_number
                        );
                        SessionJoinResult {
                            success: true,
                            error_code: 0,
                        }
                    }
                    Err(reason) => {
                        warn!(
                            port = ctx.port(),
                            "rejected join for uid {uid} to slot {}: {reason}",
                            option.session_number
                        );
                        SessionJoinResult {
                            success: false,
                            error_code: ERROR_INVALID_JOIN,
                        }
                    }
                };

                let mode = join_inner.join_packet_mode();
                match create_packet(packet_type::JOIN_SESSION, &result, mode, None) {
                    Ok(packet) => ctx.send_packet(peer, ctx.session_channel(), packet),
                    Err(e) => error!("failed to encode join reply: {e}"),
                }
            }),
        );

        let disconnect_inner = inner.clone();
        server.on_disconnect(Arc::new(move |ctx: &ServerContext, peer: PeerId| {
            if let Some(uid) = ctx.peer_uid(peer) {
                ctx.remove_peer(uid);
                disconnect_inner.remove_user(uid);
            }
        }));

        let route_inner = inner.clone();
        server.on_packet(Arc::new(move |ctx: &ServerContext, peer: PeerId, raw: &[u8]| {
            let Some(parsed) = parse_packet(raw) else {
                return;
            };
            // Lobby-only traffic never reaches a session, logged in or not.
            if matches!(
                parsed.header.type_id,
                packet_type::CREATE_SESSION
                    | packet_type::GET_SERVER_TYPE
                    | packet_type::GET_SESSION_LIST
                    | packet_type::LOGIN
            ) {
                return;
            }

            let Some(uid) = ctx.peer_uid(peer) else {
                return;
            };
            let Some(session_number) = route_inner.session_number_by_uid(uid) else {
                return;
            };
            if let Some(session) = route_inner.session(session_number) {
                session
                    .core()
                    .handle_packet(parsed.header.type_id, peer, &parsed.payload);
            }
        }));

        Ok(Self { server, inner })
    }

    /// Places a session in the lowest empty slot (or a new one), stamps its
    /// identifier, links it to this server, and starts its tick task.
    pub fn attach_session(&self, session: Arc<dyn Session>) -> u16 {
        session.core().attach(self.server.context().clone());
        let task = spawn_tick_loop(session.clone());

        let mut tables = self.inner.tables.lock().expect("session tables poisoned");
        let session_number = match tables.slots.iter().position(Option::is_none) {
            Some(slot) => {
                tables.slots[slot] = Some(session.clone());
                tables.tasks[slot] = Some(task);
                slot as u16
            }
            None => {
                tables.slots.push(Some(session.clone()));
                tables.tasks.push(Some(task));
                (tables.slots.len() - 1) as u16
            }
        };
        drop(tables);

        session.core().set_identifier(SessionIdentifier {
            session_port: self.port(),
            session_number,
        });

        let info = session.core().info();
        info!(
            port = self.port(),
            "✨ session created (slot: {session_number}, type: '{}', name: '{}', max_players: {}, private: {})",
            info.session_type,
            info.name,
            info.max_players,
            info.is_private
        );
        session_number
    }

    /// Stops and clears a session slot. The tick task is abandoned and
    /// exits within one tick interval.
    pub fn detach_session(&self, session_number: u16) -> bool {
        let mut tables = self.inner.tables.lock().expect("session tables poisoned");
        SessionServerInner::detach_slot(&mut tables, session_number, self.inner.port)
    }

    /// Public descriptions of live, non-private sessions of `session_type`,
    /// optionally filtered by a case-insensitive substring of the name.
    pub fn session_list(
        &self,
        session_type: &str,
        name_filter: Option<&str>,
    ) -> Vec<SessionInfo> {
        let filter = name_filter.map(str::to_lowercase);
        let tables = self.inner.tables.lock().expect("session tables poisoned");
        tables
            .slots
            .iter()
            .flatten()
            .filter_map(|session| {
                let info = session.core().info();
                if info.is_private || info.session_type != session_type {
                    return None;
                }
                if let Some(filter) = &filter {
                    if !info.name.to_lowercase().contains(filter.as_str()) {
                        return None;
                    }
                }
                Some(info)
            })
            .collect()
    }

    /// Number of live session slots.
    pub fn session_count(&self) -> usize {
        let tables = self.inner.tables.lock().expect("session tables poisoned");
        tables.slots.iter().flatten().count()
    }

    pub fn session_number_by_uid(&self, uid: u64) -> Option<u16> {
        self.inner.session_number_by_uid(uid)
    }

    /// The session in a slot, when live.
    pub fn session(&self, session_number: u16) -> Option<Arc<dyn Session>> {
        self.inner.session(session_number)
    }

    /// Adds a user to a session's member tables.
    pub fn add_user(&self, session_number: u16, uid: u64) {
        self.inner.add_user(session_number, uid);
    }

    /// Removes a user; detaches the session when it was the last member.
    pub fn remove_user(&self, uid: u64) -> bool {
        self.inner.remove_user(uid)
    }

    pub fn join_packet_mode(&self) -> DeliveryMode {
        self.inner.join_packet_mode()
    }

    pub fn set_join_packet_mode(&self, mode: DeliveryMode) {
        self.inner
            .join_packet_mode
            .store(mode_to_byte(mode), Ordering::Relaxed);
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

    pub async fn stop(&self) {
        self.server.stop().await;
    }

    pub async fn wait(&self) {
        self.server.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionCore;
    use crate::transport::MemoryTransport;
    use waypoint_protocol::{register_predefined_packet_types, SessionCreationOption};

    struct IdleSession {
        core: SessionCore,
    }

    impl IdleSession {
        fn new(name: &str, session_type: &str, is_private: bool) -> Arc<Self> {
            let option = SessionCreationOption {
                name: name.to_string(),
                max_players: 4,
                is_private,
                session_type: session_type.to_string(),
                ..Default::default()
            };
            let info = SessionInfo {
                name: option.name.clone(),
                max_players: option.max_players,
                is_private,
                session_type: session_type.to_string(),
                ..Default::default()
            };
            Arc::new(Self {
                core: SessionCore::new(info, &option, 60.0),
            })
        }
    }

    impl Session for IdleSession {
        fn core(&self) -> &SessionCore {
            &self.core
        }

        fn tick(&self, _delta_seconds: f64) {}
    }

    fn start(port: u16) -> SessionServer {
        register_predefined_packet_types();
        let transport = MemoryTransport::new();
        SessionServer::new(&transport, &HostConfig::new(port)).unwrap()
    }

    #[tokio::test]
    async fn attach_reuses_the_lowest_empty_slot() {
        let server = start(9200);

        assert_eq!(server.attach_session(IdleSession::new("a", "", false)), 0);
        assert_eq!(server.attach_session(IdleSession::new("b", "", false)), 1);
        assert_eq!(server.attach_session(IdleSession::new("c", "", false)), 2);
        assert_eq!(server.session_count(), 3);

        assert!(server.detach_session(1));
        assert_eq!(server.session_count(), 2);

        // slot 1 is the lowest hole and gets reused
        assert_eq!(server.attach_session(IdleSession::new("d", "", false)), 1);
        // the table is full again, so the next one appends
        assert_eq!(server.attach_session(IdleSession::new("e", "", false)), 3);
        server.stop().await;
    }

    #[tokio::test]
    async fn attach_stamps_the_session_identifier() {
        let server = start(9201);
        let session = IdleSession::new("stamped", "", false);
        let slot = server.attach_session(session.clone());

        let info = session.core().info();
        assert_eq!(info.identifier.session_port, server.port());
        assert_eq!(info.identifier.session_number, slot);
        server.stop().await;
    }

    #[tokio::test]
    async fn last_member_leaving_detaches_the_session() {
        let server = start(9202);
        let session = IdleSession::new("draining", "", false);
        let slot = server.attach_session(session.clone());

        server.add_user(slot, 1);
        server.add_user(slot, 2);
        assert_eq!(session.core().member_count(), 2);
        assert_eq!(session.core().info().current_players, 2);

        assert!(server.remove_user(1));
        assert_eq!(server.session_count(), 1);
        assert_eq!(session.core().info().current_players, 1);

        assert!(server.remove_user(2));
        assert_eq!(server.session_count(), 0);
        assert!(!session.core().is_running());
        assert!(server.session(slot).is_none());

        assert!(!server.remove_user(2));
        server.stop().await;
    }

    #[tokio::test]
    async fn member_counts_match_tables_for_any_sequence() {
        let server = start(9203);
        let session = IdleSession::new("invariant", "", false);
        let slot = server.attach_session(session.clone());

        for uid in [10, 11, 12] {
            server.add_user(slot, uid);
        }
        server.remove_user(11);

        let members = session.core().members();
        assert_eq!(members, vec![10, 12]);
        assert_eq!(session.core().info().current_players as usize, members.len());
        for uid in members {
            assert_eq!(server.session_number_by_uid(uid), Some(slot));
        }
        assert_eq!(server.session_number_by_uid(11), None);
        server.stop().await;
    }

    #[tokio::test]
    async fn session_list_filters_private_type_and_name() {
        let server = start(9204);
        server.attach_session(IdleSession::new("Crimson Arena", "arena", false));
        server.attach_session(IdleSession::new("Blue Arena", "arena", false));
        server.attach_session(IdleSession::new("Hidden Arena", "arena", true));
        server.attach_session(IdleSession::new("Duel Hall", "duel", false));

        let all_arena = server.session_list("arena", None);
        assert_eq!(all_arena.len(), 2);

        // case-insensitive substring match
        let filtered = server.session_list("arena", Some("CRIMSON"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "Crimson Arena");

        assert_eq!(server.session_list("duel", None).len(), 1);
        assert!(server.session_list("none", None).is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn join_validation_rejects_bad_slots_passwords_and_full_sessions() {
        let server = start(9205);

        let option = SessionCreationOption {
            name: "locked".to_string(),
            password: Some("sesame".to_string()),
            max_players: 1,
            ..Default::default()
        };
        let info = SessionInfo {
            name: option.name.clone(),
            max_players: 1,
            has_password: true,
            ..Default::default()
        };
        let session = Arc::new(IdleSession {
            core: SessionCore::new(info, &option, 60.0),
        });
        let slot = server.attach_session(session);

        let join = |session_number: u16, password: Option<&str>| SessionJoinOption {
            user_identifier: Default::default(),
            session_number,
            password: password.map(str::to_string),
        };

        assert!(server.inner.validate_join(&join(slot, Some("sesame"))).is_ok());
        assert!(server.inner.validate_join(&join(slot, Some("wrong"))).is_err());
        assert!(server.inner.validate_join(&join(slot, None)).is_err());
        assert!(server.inner.validate_join(&join(99, Some("sesame"))).is_err());

        server.add_user(slot, 7);
        // now full
        assert!(server.inner.validate_join(&join(slot, Some("sesame"))).is_err());
        server.stop().await;
    }

    #[tokio::test]
    async fn detaching_a_dead_slot_fails() {
        let server = start(9206);
        assert!(!server.detach_session(0));

        let slot = server.attach_session(IdleSession::new("once", "", false));
        assert!(server.detach_session(slot));
        assert!(!server.detach_session(slot));
        server.stop().await;
    }
}
