//! Evented server base: context, handler framework, and event loop.

pub mod context;
pub mod core;
pub mod handler;

pub use context::{PeerUidTable, ServerContext, ServerType};
pub use core::Server;
pub use handler::{
    server_handler, server_handler_raw, session_handler, session_handler_raw,
    ConnectionObserverFn, HandlerId, PacketHandlerFn, PacketObserverFn, SessionPacketHandlerFn,
};
