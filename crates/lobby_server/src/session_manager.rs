//! Placement and provisioning of sessions across the session-server fleet.
//!
//! Each session-server hosts sessions of exactly one type, fixed when the
//! server is provisioned. New sessions land on the first matching server
//! with spare capacity; when none exists the manager provisions the next
//! server in the configured port range. The k-th server ever provisioned
//! listens on `port_range.0 + k`, so clients can connect straight to the
//! port returned in the creation result.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info};

use crate::config::SessionServerOption;
use crate::server::handler::{
    next_handler_id, ConnectionObserverFn, HandlerId, PacketObserverFn,
};
use crate::session::Session;
use crate::session_server::SessionServer;
use crate::transport::Transport;
use waypoint_protocol::{
    SessionCreationOption, SessionCreationResult, SessionIdentifier, SessionInfo,
    SessionListOption, SessionListResult,
};

/// Error code for creation requests naming an unregistered session type.
pub const ERROR_UNKNOWN_SESSION_TYPE: u8 = 1;
/// Error code for creation requests the fleet has no room for.
pub const ERROR_FLEET_CAPACITY: u8 = 2;

/// Builds a session from its freshly assembled info and the creation
/// request. Registered per session type.
pub type SessionGenerator =
    Arc<dyn Fn(SessionInfo, &SessionCreationOption) -> Arc<dyn Session> + Send + Sync>;

/// Resolves a uid to a display name for `SessionInfo::author_name`.
pub type UsernameFn = Arc<dyn Fn(u64) -> String + Send + Sync>;

#[derive(Default)]
struct Fleet {
    servers: Vec<Arc<SessionServer>>,
    session_types: Vec<String>,
}

#[derive(Default)]
struct ReplaySets {
    connect: BTreeMap<HandlerId, Arc<ConnectionObserverFn>>,
    disconnect: BTreeMap<HandlerId, Arc<ConnectionObserverFn>>,
    packet: BTreeMap<HandlerId, Arc<PacketObserverFn>>,
}

/// Owns the session-server fleet and decides where sessions live.
pub struct SessionManager {
    option: SessionServerOption,
    username_fn: UsernameFn,
    transport: Arc<dyn Transport>,
    generators: RwLock<HashMap<String, SessionGenerator>>,
    fleet: Mutex<Fleet>,
    replay: Mutex<ReplaySets>,
}

impl SessionManager {
    pub fn new(
        option: SessionServerOption,
        username_fn: UsernameFn,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            option,
            username_fn,
            transport,
            generators: RwLock::new(HashMap::new()),
            fleet: Mutex::new(Fleet::default()),
            replay: Mutex::new(ReplaySets::default()),
        }
    }

    /// Registers the generator invoked for creation requests of
    /// `session_type`, replacing any previous one.
    pub fn register_session_generator(&self, session_type: &str, generator: SessionGenerator) {
        self.generators
            .write()
            .expect("generator registry poisoned")
            .insert(session_type.to_string(), generator);
    }

    pub fn remove_session_generator(&self, session_type: &str) {
        self.generators
            .write()
            .expect("generator registry poisoned")
            .remove(session_type);
    }

    /// Creates and places a session.
    ///
    /// Failure is always structured: error code 1 for an unknown session
    /// type, 2 when the fleet is out of capacity (including the rare case
    /// where provisioning a new server fails).
    pub fn create_session(&self, option: &SessionCreationOption) -> SessionCreationResult {
        let generator = self
            .generators
            .read()
            .expect("generator registry poisoned")
            .get(&option.session_type)
            .cloned();
        let Some(generator) = generator else {
            return SessionCreationResult {
                success: false,
                error_code: ERROR_UNKNOWN_SESSION_TYPE,
                session_info: None,
            };
        };

        let mut info = SessionInfo {
            name: option.name.clone(),
            identifier: SessionIdentifier::default(),
            max_players: option.max_players,
            current_players: 0,
            is_private: option.is_private,
            has_password: option.password.is_some(),
            author_name: (self.username_fn)(option.user_identifier.user_id),
            session_type: option.session_type.clone(),
        };
        let session = generator(info.clone(), option);

        let mut fleet = self.fleet.lock().expect("fleet poisoned");

        // Prefer an existing server of the right type with room to spare.
        for (server, session_type) in fleet.servers.iter().zip(&fleet.session_types) {
            if session_type == &option.session_type
                && server.session_count() < usize::from(self.option.max_sessions)
            {
                info.identifier.session_number = server.attach_session(session.clone());
                info.identifier.session_port = server.port();
                return SessionCreationResult {
                    success: true,
                    error_code: 0,
                    session_info: Some(info),
                };
            }
        }

        let provisioned = fleet.servers.len() as u16;
        if provisioned >= self.option.max_sessions {
            return SessionCreationResult {
                success: false,
                error_code: ERROR_FLEET_CAPACITY,
                session_info: None,
            };
        }

        let port = self.option.port_range.0 + provisioned;
        let server = match SessionServer::new(self.transport.as_ref(), &self.option.host_config(port))
        {
            Ok(server) => Arc::new(server),
            Err(e) => {
                error!("failed to provision session server on port {port}: {e}");
                return SessionCreationResult {
                    success: false,
                    error_code: ERROR_FLEET_CAPACITY,
                    session_info: None,
                };
            }
        };

        // New servers observe the same event surface as the rest of the
        // fleet: every observer registered so far is replayed onto them.
        {
            let replay = self.replay.lock().expect("replay sets poisoned");
            for observer in replay.connect.values() {
                server.on_connect(observer.clone());
            }
            for observer in replay.disconnect.values() {
                server.on_disconnect(observer.clone());
            }
            for observer in replay.packet.values() {
                server.on_packet(observer.clone());
            }
        }

        info.identifier.session_port = server.port();
        info.identifier.session_number = server.attach_session(session);

        info!(
            "🛰️ session server provisioned (port: {}, type: '{}')",
            server.port(),
            option.session_type
        );

        fleet.servers.push(server);
        fleet.session_types.push(option.session_type.clone());

        SessionCreationResult {
            success: true,
            error_code: 0,
            session_info: Some(info),
        }
    }

    /// Fleet-wide session listing with 1-based paging.
    ///
    /// `total_session_count` counts every match before the page is cut.
    pub fn session_list(&self, option: &SessionListOption) -> SessionListResult {
        let fleet = self.fleet.lock().expect("fleet poisoned");
        let mut matches = Vec::new();
        for server in &fleet.servers {
            matches.extend(server.session_list(&option.session_type, option.name_filter.as_deref()));
        }
        drop(fleet);

        let total_session_count = matches.len() as u32;
        let sessions = match option.page.checked_sub(1) {
            Some(page_index) => {
                let start = page_index as usize * option.sessions_per_page as usize;
                if start < matches.len() {
                    let end = (start + option.sessions_per_page as usize).min(matches.len());
                    matches[start..end].to_vec()
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        };

        SessionListResult {
            total_session_count,
            sessions,
        }
    }

    /// Registers a connection observer replayed onto every future
    /// session-server. Servers provisioned earlier are not retrofitted.
    pub fn on_session_server_connect(&self, observer: Arc<ConnectionObserverFn>) -> HandlerId {
        let id = next_handler_id();
        self.replay
            .lock()
            .expect("replay sets poisoned")
            .connect
            .insert(id, observer);
        id
    }

    pub fn remove_session_server_connect(&self, id: HandlerId) -> bool {
        self.replay
            .lock()
            .expect("replay sets poisoned")
            .connect
            .remove(&id)
            .is_some()
    }

    /// Disconnection counterpart of [`on_session_server_connect`].
    ///
    /// [`on_session_server_connect`]: SessionManager::on_session_server_connect
    pub fn on_session_server_disconnect(&self, observer: Arc<ConnectionObserverFn>) -> HandlerId {
        let id = next_handler_id();
        self.replay
            .lock()
            .expect("replay sets poisoned")
            .disconnect
            .insert(id, observer);
        id
    }

    pub fn remove_session_server_disconnect(&self, id: HandlerId) -> bool {
        self.replay
            .lock()
            .expect("replay sets poisoned")
            .disconnect
            .remove(&id)
            .is_some()
    }

    /// Packet-observer counterpart of [`on_session_server_connect`].
    ///
    /// [`on_session_server_connect`]: SessionManager::on_session_server_connect
    pub fn on_session_server_packet(&self, observer: Arc<PacketObserverFn>) -> HandlerId {
        let id = next_handler_id();
        self.replay
            .lock()
            .expect("replay sets poisoned")
            .packet
            .insert(id, observer);
        id
    }

    pub fn remove_session_server_packet(&self, id: HandlerId) -> bool {
        self.replay
            .lock()
            .expect("replay sets poisoned")
            .packet
            .remove(&id)
            .is_some()
    }

    /// Number of session-servers provisioned so far.
    pub fn server_count(&self) -> usize {
        self.fleet.lock().expect("fleet poisoned").servers.len()
    }

    /// Stops every provisioned session-server.
    pub async fn stop_all(&self) {
        let servers: Vec<_> = {
            let fleet = self.fleet.lock().expect("fleet poisoned");
            fleet.servers.clone()
        };
        for server in servers {
            server.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionCore;
    use crate::transport::MemoryTransport;
    use waypoint_protocol::{register_predefined_packet_types, UserIdentifier};

    struct IdleSession {
        core: SessionCore,
    }

    impl Session for IdleSession {
        fn core(&self) -> &SessionCore {
            &self.core
        }

        fn tick(&self, _delta_seconds: f64) {}
    }

    fn idle_generator() -> SessionGenerator {
        Arc::new(|info, option| {
            Arc::new(IdleSession {
                core: SessionCore::new(info, option, 60.0),
            })
        })
    }

    fn manager(option: SessionServerOption) -> SessionManager {
        manager_on(option).1
    }

    fn manager_on(option: SessionServerOption) -> (MemoryTransport, SessionManager) {
        register_predefined_packet_types();
        let transport = MemoryTransport::new();
        let manager = SessionManager::new(
            option,
            Arc::new(|uid| format!("user-{uid}")),
            Arc::new(transport.clone()),
        );
        (transport, manager)
    }

    fn creation(name: &str, session_type: &str) -> SessionCreationOption {
        SessionCreationOption {
            name: name.to_string(),
            password: None,
            max_players: 4,
            is_private: false,
            user_identifier: UserIdentifier {
                user_id: 7,
                user_token: String::new(),
            },
            session_type: session_type.to_string(),
        }
    }

    #[tokio::test]
    async fn unknown_session_type_fails_with_code_one() {
        let manager = manager(SessionServerOption::default());
        let result = manager.create_session(&creation("nope", "unregistered"));
        assert!(!result.success);
        assert_eq!(result.error_code, ERROR_UNKNOWN_SESSION_TYPE);
        assert!(result.session_info.is_none());
    }

    #[tokio::test]
    async fn first_session_lands_on_the_first_port() {
        let option = SessionServerOption {
            port_range: (6000, 6010),
            ..Default::default()
        };
        let manager = manager(option);
        manager.register_session_generator("", idle_generator());

        let result = manager.create_session(&creation("Arena", ""));
        assert!(result.success);
        let info = result.session_info.unwrap();
        assert_eq!(info.identifier.session_port, 6000);
        assert_eq!(info.identifier.session_number, 0);
        assert_eq!(info.author_name, "user-7");
        assert_eq!(info.current_players, 0);
        assert!(!info.has_password);
        assert_eq!(manager.server_count(), 1);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn same_type_sessions_fill_one_server_before_a_second_exists() {
        let option = SessionServerOption {
            max_sessions: 3,
            port_range: (6100, 6110),
            ..Default::default()
        };
        let manager = manager(option);
        manager.register_session_generator("arena", idle_generator());

        for i in 0..3 {
            let result = manager.create_session(&creation(&format!("room-{i}"), "arena"));
            let info = result.session_info.unwrap();
            assert_eq!(info.identifier.session_port, 6100);
            assert_eq!(info.identifier.session_number, i as u16);
        }
        assert_eq!(manager.server_count(), 1);

        // the first server is full, so a second one is provisioned
        let result = manager.create_session(&creation("overflow", "arena"));
        let info = result.session_info.unwrap();
        assert_eq!(info.identifier.session_port, 6101);
        assert_eq!(info.identifier.session_number, 0);
        assert_eq!(manager.server_count(), 2);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn each_session_type_gets_its_own_server() {
        let option = SessionServerOption {
            port_range: (6200, 6210),
            ..Default::default()
        };
        let manager = manager(option);
        manager.register_session_generator("arena", idle_generator());
        manager.register_session_generator("duel", idle_generator());

        let arena = manager.create_session(&creation("a", "arena"));
        let duel = manager.create_session(&creation("d", "duel"));

        assert_eq!(arena.session_info.unwrap().identifier.session_port, 6200);
        assert_eq!(duel.session_info.unwrap().identifier.session_port, 6201);
        assert_eq!(manager.server_count(), 2);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn fleet_capacity_fails_with_code_two() {
        let option = SessionServerOption {
            max_sessions: 1,
            port_range: (6300, 6310),
            ..Default::default()
        };
        let manager = manager(option);
        manager.register_session_generator("arena", idle_generator());
        manager.register_session_generator("duel", idle_generator());

        assert!(manager.create_session(&creation("a", "arena")).success);

        // one server exists and the fleet cap is 1: a new type cannot be placed
        let result = manager.create_session(&creation("d", "duel"));
        assert!(!result.success);
        assert_eq!(result.error_code, ERROR_FLEET_CAPACITY);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn paging_slices_the_concatenated_list() {
        let option = SessionServerOption {
            max_sessions: 20,
            port_range: (6400, 6430),
            ..Default::default()
        };
        let manager = manager(option);
        manager.register_session_generator("", idle_generator());

        for i in 0..12 {
            assert!(manager.create_session(&creation(&format!("room-{i:02}"), "")).success);
        }

        let page = |page, per| {
            manager.session_list(&SessionListOption {
                name_filter: None,
                page,
                sessions_per_page: per,
                session_type: String::new(),
            })
        };

        let first = page(1, 5);
        assert_eq!(first.total_session_count, 12);
        assert_eq!(first.sessions.len(), 5);
        assert_eq!(first.sessions[0].name, "room-00");

        let second = page(2, 5);
        assert_eq!(second.total_session_count, 12);
        assert_eq!(second.sessions.len(), 5);
        assert_eq!(second.sessions[0].name, "room-05");
        assert_eq!(second.sessions[4].name, "room-09");

        let third = page(3, 5);
        assert_eq!(third.sessions.len(), 2);

        let beyond = page(4, 5);
        assert_eq!(beyond.total_session_count, 12);
        assert!(beyond.sessions.is_empty());

        // page 0 is out of range for 1-based paging
        assert!(page(0, 5).sessions.is_empty());
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn observers_replay_onto_newly_provisioned_servers() {
        use crate::transport::MemoryClient;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let option = SessionServerOption {
            port_range: (6500, 6510),
            ..Default::default()
        };
        let (transport, manager) = manager_on(option);
        manager.register_session_generator("", idle_generator());

        let connects = Arc::new(AtomicUsize::new(0));
        {
            let connects = connects.clone();
            manager.on_session_server_connect(Arc::new(move |_ctx, _peer| {
                connects.fetch_add(1, Ordering::Relaxed);
            }));
        }

        assert!(manager.create_session(&creation("observed", "")).success);
        assert_eq!(manager.server_count(), 1);

        // the freshly provisioned server on 6500 carries the observer
        let client = MemoryClient::connect(&transport, 6500).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connects.load(Ordering::Relaxed), 1);

        client.disconnect().await;
        manager.stop_all().await;
    }
}
