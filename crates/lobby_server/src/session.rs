//! Session state and the fixed-rate tick loop.
//!
//! Application sessions implement [`Session`] and embed a [`SessionCore`],
//! which carries everything the framework manages: the public
//! [`SessionInfo`], the member list, the optional password, the typed
//! handler registry, the running flag, and a non-owning link to the hosting
//! server. The hosting session-server mutates members from its event worker
//! while the tick task reads them, so all of that state lives behind locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::error;

use crate::server::context::ServerContext;
use crate::server::handler::SessionPacketHandlerFn;
use crate::transport::PeerId;
use waypoint_protocol::{packet_type_id, Packet, SessionCreationOption, SessionIdentifier, SessionInfo};

/// A long-lived stateful context with its own tick loop and members.
///
/// `tick` is invoked serially from the session's dedicated task with the
/// wall-clock seconds elapsed since the previous tick.
pub trait Session: Send + Sync {
    fn core(&self) -> &SessionCore;
    fn tick(&self, delta_seconds: f64);
}

struct SessionState {
    info: SessionInfo,
    members: Vec<u64>,
}

/// Framework-managed state embedded by every session implementation.
pub struct SessionCore {
    state: RwLock<SessionState>,
    password: Option<String>,
    framerate: f64,
    running: AtomicBool,
    handlers: RwLock<HashMap<u16, Vec<Arc<SessionPacketHandlerFn>>>>,
    link: OnceLock<Arc<ServerContext>>,
}

impl SessionCore {
    /// Builds the core from the freshly created info and the creation
    /// request. `framerate` is ticks per second and must be positive.
    pub fn new(info: SessionInfo, option: &SessionCreationOption, framerate: f64) -> Self {
        assert!(framerate > 0.0, "session framerate must be positive");
        Self {
            state: RwLock::new(SessionState {
                info,
                members: Vec::new(),
            }),
            password: option.password.clone(),
            framerate,
            running: AtomicBool::new(true),
            handlers: RwLock::new(HashMap::new()),
            link: OnceLock::new(),
        }
    }

    pub fn framerate(&self) -> f64 {
        self.framerate
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Asks the tick task to exit at its next loop check.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Snapshot of the public session description.
    pub fn info(&self) -> SessionInfo {
        self.state.read().expect("session state poisoned").info.clone()
    }

    /// Replaces the public session description.
    pub fn set_info(&self, info: SessionInfo) {
        self.state.write().expect("session state poisoned").info = info;
    }

    /// Uids currently in the session.
    pub fn members(&self) -> Vec<u64> {
        self.state
            .read()
            .expect("session state poisoned")
            .members
            .clone()
    }

    pub fn member_count(&self) -> usize {
        self.state
            .read()
            .expect("session state poisoned")
            .members
            .len()
    }

    pub fn session_type(&self) -> String {
        self.state
            .read()
            .expect("session state poisoned")
            .info
            .session_type
            .clone()
    }

    /// Checks a join password. Sessions without a password accept anything.
    pub fn compare_password(&self, input: &str) -> bool {
        match &self.password {
            Some(password) => password == input,
            None => true,
        }
    }

    /// Appends a handler for a packet type id; the same instance is
    /// rejected when already registered for that id.
    pub fn register_packet_handler(
        &self,
        type_id: u16,
        handler: Arc<SessionPacketHandlerFn>,
    ) -> bool {
        let mut map = self.handlers.write().expect("session handlers poisoned");
        let list = map.entry(type_id).or_default();
        if list.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
            return false;
        }
        list.push(handler);
        true
    }

    pub fn register_packet_handler_by_name(
        &self,
        type_name: &str,
        handler: Arc<SessionPacketHandlerFn>,
    ) -> bool {
        match packet_type_id(type_name) {
            Some(type_id) => self.register_packet_handler(type_id, handler),
            None => false,
        }
    }

    pub fn remove_packet_handler(
        &self,
        type_id: u16,
        handler: &Arc<SessionPacketHandlerFn>,
    ) -> bool {
        let mut map = self.handlers.write().expect("session handlers poisoned");
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
        handler: &Arc<SessionPacketHandlerFn>,
    ) -> bool {
        match packet_type_id(type_name) {
            Some(type_id) => self.remove_packet_handler(type_id, handler),
            None => false,
        }
    }

    /// Invokes every handler bound to `type_id` in registration order.
    pub fn handle_packet(&self, type_id: u16, peer: PeerId, raw: &[u8]) {
        let handlers: Vec<_> = self
            .handlers
            .read()
            .expect("session handlers poisoned")
            .get(&type_id)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(self, peer, raw);
        }
    }

    /// Resolves a peer to its uid through the hosting server.
    pub fn peer_uid(&self, peer: PeerId) -> Option<u64> {
        self.link.get().and_then(|ctx| ctx.peer_uid(peer))
    }

    /// Sends a packet to a peer through the hosting server.
    pub fn send_packet(&self, peer: PeerId, channel: u8, packet: Packet) {
        match self.link.get() {
            Some(ctx) => ctx.send_packet(peer, channel, packet),
            None => error!("session is not attached to a server; packet dropped"),
        }
    }

    /// Sends a packet to a member by uid through the hosting server.
    pub fn send_packet_to_uid(&self, uid: u64, channel: u8, packet: Packet) {
        match self.link.get() {
            Some(ctx) => ctx.send_packet_to_uid(uid, channel, packet),
            None => error!("session is not attached to a server; packet dropped"),
        }
    }

    pub(crate) fn attach(&self, ctx: Arc<ServerContext>) {
        let _ = self.link.set(ctx);
    }

    pub(crate) fn set_identifier(&self, identifier: SessionIdentifier) {
        self.state
            .write()
            .expect("session state poisoned")
            .info
            .identifier = identifier;
    }

    pub(crate) fn add_member(&self, uid: u64) {
        let mut state = self.state.write().expect("session state poisoned");
        state.members.push(uid);
        state.info.current_players = state.members.len() as u8;
    }

    /// Removes a member and returns how many remain.
    pub(crate) fn remove_member(&self, uid: u64) -> usize {
        let mut state = self.state.write().expect("session state poisoned");
        state.members.retain(|member| *member != uid);
        state.info.current_players = state.members.len() as u8;
        state.members.len()
    }
}

/// Runs a session's tick loop on its own task at `framerate` ticks per
/// second.
///
/// Missed deadlines slip: when a tick overruns its interval the schedule is
/// reset from the current instant instead of replaying the backlog, so the
/// loop never runs catch-up ticks back to back.
pub(crate) fn spawn_tick_loop(session: Arc<dyn Session>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tick_interval = Duration::from_secs_f64(1.0 / session.core().framerate());
        let mut previous = Instant::now();
        let mut next_tick = previous + tick_interval;

        while session.core().is_running() {
            let now = Instant::now();
            let delta = now - previous;
            previous = now;

            session.tick(delta.as_secs_f64());

            next_tick += tick_interval;
            if Instant::now() < next_tick {
                sleep_until(next_tick).await;
            } else {
                next_tick = Instant::now();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    struct CountingSession {
        core: SessionCore,
        ticks: AtomicU32,
        deltas: Mutex<Vec<f64>>,
    }

    impl CountingSession {
        fn new(framerate: f64) -> Arc<Self> {
            let info = SessionInfo {
                name: "counting".to_string(),
                ..Default::default()
            };
            Arc::new(Self {
                core: SessionCore::new(info, &SessionCreationOption::default(), framerate),
                ticks: AtomicU32::new(0),
                deltas: Mutex::new(Vec::new()),
            })
        }
    }

    impl Session for CountingSession {
        fn core(&self) -> &SessionCore {
            &self.core
        }

        fn tick(&self, delta_seconds: f64) {
            self.ticks.fetch_add(1, Ordering::Relaxed);
            self.deltas.lock().unwrap().push(delta_seconds);
        }
    }

    #[tokio::test]
    async fn tick_loop_runs_near_the_configured_rate() {
        let session = CountingSession::new(50.0);
        let handle = spawn_tick_loop(session.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        session.core().stop();
        let _ = handle.await;

        let ticks = session.ticks.load(Ordering::Relaxed);
        // 50 fps over 300 ms is ~15 ticks; accept generous scheduling slop.
        assert!((5..=25).contains(&ticks), "unexpected tick count {ticks}");

        let deltas = session.deltas.lock().unwrap();
        // deltas after the first are close to the interval and never negative
        assert!(deltas.iter().all(|d| *d >= 0.0));
    }

    #[tokio::test]
    async fn stop_ends_the_loop_within_one_interval() {
        let session = CountingSession::new(20.0);
        let handle = spawn_tick_loop(session.clone());

        tokio::time::sleep(Duration::from_millis(80)).await;
        session.core().stop();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("tick task should exit promptly")
            .unwrap();
    }

    #[test]
    fn members_and_player_count_stay_in_sync() {
        let core = SessionCore::new(
            SessionInfo::default(),
            &SessionCreationOption::default(),
            60.0,
        );

        core.add_member(1);
        core.add_member(2);
        assert_eq!(core.member_count(), 2);
        assert_eq!(core.info().current_players, 2);

        assert_eq!(core.remove_member(1), 1);
        assert_eq!(core.info().current_players, 1);
        assert_eq!(core.members(), vec![2]);
    }

    #[test]
    fn password_comparison() {
        let open = SessionCore::new(
            SessionInfo::default(),
            &SessionCreationOption::default(),
            60.0,
        );
        assert!(open.compare_password(""));
        assert!(open.compare_password("anything"));

        let locked = SessionCore::new(
            SessionInfo::default(),
            &SessionCreationOption {
                password: Some("sesame".to_string()),
                ..Default::default()
            },
            60.0,
        );
        assert!(locked.compare_password("sesame"));
        assert!(!locked.compare_password("wrong"));
        assert!(!locked.compare_password(""));
    }

    #[test]
    fn session_handlers_dedup_and_dispatch_in_order() {
        let core = SessionCore::new(
            SessionInfo::default(),
            &SessionCreationOption::default(),
            60.0,
        );
        let order = Arc::new(Mutex::new(Vec::new()));

        let first: Arc<SessionPacketHandlerFn> = {
            let order = order.clone();
            Arc::new(move |_core, _peer, _raw| order.lock().unwrap().push(1))
        };
        let second: Arc<SessionPacketHandlerFn> = {
            let order = order.clone();
            Arc::new(move |_core, _peer, _raw| order.lock().unwrap().push(2))
        };

        assert!(core.register_packet_handler(5, first.clone()));
        assert!(!core.register_packet_handler(5, first.clone()));
        assert!(core.register_packet_handler(5, second));

        core.handle_packet(5, PeerId(1), &[]);
        assert_eq!(order.lock().unwrap().as_slice(), &[1, 2]);

        assert!(core.remove_packet_handler(5, &first));
        core.handle_packet(5, PeerId(1), &[]);
        assert_eq!(order.lock().unwrap().as_slice(), &[1, 2, 2]);
    }
}
