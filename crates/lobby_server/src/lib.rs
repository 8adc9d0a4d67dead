//! # Lobby Server Core
//!
//! Infrastructure for session-oriented realtime applications in the
//! lobby + game-room style. One [`MainServer`] authenticates clients, lists
//! sessions, and creates them on demand; creation places the session on a
//! fleet of [`SessionServer`]s provisioned from a port range, each hosting
//! many independent sessions with their own tick loops.
//!
//! ## Design Philosophy
//!
//! The core contains no game logic. Applications supply a login predicate,
//! session generators per session type, and packet handlers; the framework
//! provides the event loops, the packet dispatch tables, the peer↔uid
//! identity mapping, and the fleet lifecycle.
//!
//! ## Architecture Overview
//!
//! * **Transport**: a pluggable reliable-UDP seam ([`transport::Host`])
//!   with a bundled UDP backend and an in-process loopback for tests
//! * **Server base**: one event worker per server draining transport
//!   events into observers and typed handlers
//! * **Session fleet**: slot-addressed sessions per server, placement and
//!   provisioning across a port range, automatic draining of empty sessions
//! * **Tick loops**: one task per session at its own framerate, with
//!   missed deadlines slipping instead of bursting
//!
//! ## Startup contract
//!
//! Call [`initialize`] once before constructing any server: it registers
//! the framework's packet types and starts the global log relay.

pub mod config;
pub mod error;
pub mod logging;
pub mod main_server;
pub mod server;
pub mod session;
pub mod session_manager;
pub mod session_server;
pub mod transport;

pub use config::{HostConfig, SessionServerOption};
pub use error::ServerError;
pub use main_server::{LoginFn, MainServer};
pub use server::{
    server_handler, server_handler_raw, session_handler, session_handler_raw, HandlerId,
    PeerUidTable, Server, ServerContext, ServerType,
};
pub use session::{Session, SessionCore};
pub use session_manager::{SessionGenerator, SessionManager, UsernameFn};
pub use session_server::SessionServer;
pub use transport::{
    Host, HostEvent, HostSender, MemoryClient, MemoryTransport, PeerId, Transport, UdpClient,
    UdpTransport,
};

// The wire protocol is part of this crate's public API surface.
pub use waypoint_protocol as protocol;
pub use waypoint_protocol::{DeliveryMode, Packet};

use std::sync::Once;

static INITIALIZE: Once = Once::new();

/// Process-wide startup: registers the framework packet types and starts
/// the global log relay. Must run inside a tokio runtime, before any server
/// is constructed. Safe to call more than once.
pub fn initialize() {
    INITIALIZE.call_once(|| {
        waypoint_protocol::register_predefined_packet_types();
        logging::init_global_log_relay(logging::DEFAULT_LOG_QUEUE_SIZE);
    });
}
