//! # Waypoint Protocol
//!
//! Wire protocol shared by Waypoint servers and clients: a typed packet
//! codec over length-prefixed MessagePack frames, a process-wide packet
//! type registry, and the data model for login, session creation, joining,
//! and listing.
//!
//! ## Frame layout
//!
//! Every transport packet carries one frame:
//!
//! ```text
//! offset  size  field
//! 0       4     header length (u32, little-endian)
//! 4       H     msgpack array header: [type_id: u16, timestamp: i64]
//! 4+H     *     msgpack payload (shape determined by type_id)
//! ```
//!
//! All domain structs are encoded as msgpack *arrays* in field-declaration
//! order, never as maps. The payload stays opaque at the framing layer;
//! dispatch re-decodes it per handler.
//!
//! ## Type registry
//!
//! Packet type names map to 16-bit ids through a process-wide bidirectional
//! registry. The framework reserves the top of the id range for its own
//! packets (see [`packet_type`]); applications register their own types once
//! at startup via [`register_packet_type`].

pub mod error;
pub mod packet;
pub mod registry;
pub mod types;

pub use error::ProtocolError;
pub use packet::{
    create_empty_packet, create_empty_packet_by_name, create_packet, create_packet_by_name,
    current_timestamp_ms, generate_uuid, parse_packet, parse_payload, try_parse_payload,
    DeliveryMode, Packet, ParsedPacket,
};
pub use registry::{
    packet_type, packet_type_id, packet_type_name, register_packet_type,
    register_predefined_packet_types,
};
pub use types::{
    BufferSize, LoginData, LoginResult, PacketHeader, SessionCreationOption,
    SessionCreationResult, SessionIdentifier, SessionInfo, SessionJoinOption, SessionJoinResult,
    SessionListOption, SessionListResult, UserIdentifier,
};
