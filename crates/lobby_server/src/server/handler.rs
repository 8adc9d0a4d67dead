//! Function-shaped packet handlers.
//!
//! Dispatch is keyed by packet type id; a handler is any `Fn` over the
//! server context, the originating peer, and the raw payload bytes. The
//! typed constructors below wrap user functions so the payload arrives
//! already decoded and, for session handlers, with the peer resolved to
//! its logged-in uid.

use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::server::context::ServerContext;
use crate::session::SessionCore;
use crate::transport::PeerId;
use waypoint_protocol::parse_payload;

/// Identifier handed out for registered observers, unique process-wide and
/// monotonically increasing from 1. Observer dispatch follows id order, so
/// registration order is dispatch order.
pub type HandlerId = u64;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_handler_id() -> HandlerId {
    NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Raw packet handler bound to a type id on a server.
pub type PacketHandlerFn = dyn Fn(&ServerContext, PeerId, &[u8]) + Send + Sync;

/// Raw packet handler bound to a type id on a session.
pub type SessionPacketHandlerFn = dyn Fn(&SessionCore, PeerId, &[u8]) + Send + Sync;

/// Observer of peer connect/disconnect events.
pub type ConnectionObserverFn = dyn Fn(&ServerContext, PeerId) + Send + Sync;

/// Observer of raw received packets, invoked before typed dispatch.
pub type PacketObserverFn = dyn Fn(&ServerContext, PeerId, &[u8]) + Send + Sync;

/// Wraps a typed function into a server packet handler.
///
/// The payload is decoded as `T`; on decode failure the handler still runs
/// with `T::default()` so it can produce a structured failure reply.
pub fn server_handler<T, F>(f: F) -> Arc<PacketHandlerFn>
where
    T: DeserializeOwned + Default + 'static,
    F: Fn(&ServerContext, PeerId, T) + Send + Sync + 'static,
{
    Arc::new(move |ctx, peer, raw| f(ctx, peer, parse_payload::<T>(raw)))
}

/// Wraps a payload-less function into a server packet handler.
pub fn server_handler_raw<F>(f: F) -> Arc<PacketHandlerFn>
where
    F: Fn(&ServerContext, PeerId) + Send + Sync + 'static,
{
    Arc::new(move |ctx, peer, _raw| f(ctx, peer))
}

/// Wraps a typed function into a session packet handler.
///
/// Resolves the peer to its uid through the hosting server's peer table and
/// dispatches only when the peer is logged in.
pub fn session_handler<T, F>(f: F) -> Arc<SessionPacketHandlerFn>
where
    T: DeserializeOwned + Default + 'static,
    F: Fn(&SessionCore, u64, T) + Send + Sync + 'static,
{
    Arc::new(move |core, peer, raw| {
        if let Some(uid) = core.peer_uid(peer) {
            f(core, uid, parse_payload::<T>(raw));
        }
    })
}

/// Wraps a payload-less function into a session packet handler.
pub fn session_handler_raw<F>(f: F) -> Arc<SessionPacketHandlerFn>
where
    F: Fn(&SessionCore, u64) + Send + Sync + 'static,
{
    Arc::new(move |core, peer, _raw| {
        if let Some(uid) = core.peer_uid(peer) {
            f(core, uid);
        }
    })
}
