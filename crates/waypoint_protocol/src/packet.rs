//! Length-prefixed packet codec.
//!
//! Encoding packs the header with msgpack, prepends its length as a 4-byte
//! little-endian prefix, and appends the msgpack payload. Decoding splits a
//! frame back into header and opaque payload bytes; the dispatch layer
//! re-decodes the payload per handler.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

use crate::error::ProtocolError;
use crate::registry::packet_type_id;
use crate::types::PacketHeader;

const HEADER_LEN_PREFIX: usize = 4;

/// Delivery guarantee requested for a packet, honored by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Delivered exactly once, in order, per channel
    #[default]
    Reliable,
    /// Best effort; may be dropped or reordered
    Unreliable,
}

/// An encoded frame plus the delivery mode it should be sent with.
#[derive(Debug, Clone)]
pub struct Packet {
    pub bytes: Bytes,
    pub mode: DeliveryMode,
}

impl Packet {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A decoded frame: the header plus the still-encoded payload bytes.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub header: PacketHeader,
    pub payload: Bytes,
}

/// Milliseconds since the Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Random v4 UUID as a string.
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn build_frame(
    type_id: u16,
    payload: Option<&[u8]>,
    mode: DeliveryMode,
    timestamp: Option<i64>,
) -> Result<Packet, ProtocolError> {
    let header = PacketHeader {
        type_id,
        timestamp: timestamp.unwrap_or_else(current_timestamp_ms),
    };
    let header_bytes = rmp_serde::to_vec(&header)?;
    let payload_len = payload.map_or(0, <[u8]>::len);

    let mut buf = BytesMut::with_capacity(HEADER_LEN_PREFIX + header_bytes.len() + payload_len);
    buf.put_u32_le(header_bytes.len() as u32);
    buf.put_slice(&header_bytes);
    if let Some(payload) = payload {
        buf.put_slice(payload);
    }

    Ok(Packet {
        bytes: buf.freeze(),
        mode,
    })
}

/// Encodes a payload into a framed packet for the given type id.
///
/// `timestamp` defaults to the current wall clock in epoch milliseconds.
pub fn create_packet<T: Serialize>(
    type_id: u16,
    payload: &T,
    mode: DeliveryMode,
    timestamp: Option<i64>,
) -> Result<Packet, ProtocolError> {
    let payload = rmp_serde::to_vec(payload)?;
    build_frame(type_id, Some(&payload), mode, timestamp)
}

/// Encodes a header-only packet (no payload) for the given type id.
pub fn create_empty_packet(
    type_id: u16,
    mode: DeliveryMode,
    timestamp: Option<i64>,
) -> Result<Packet, ProtocolError> {
    build_frame(type_id, None, mode, timestamp)
}

/// Encodes a payload for a packet type looked up by name.
///
/// Returns `None` (after logging) when the name is unregistered or encoding
/// fails; callers treat `None` as "nothing to send".
pub fn create_packet_by_name<T: Serialize>(
    type_name: &str,
    payload: &T,
    mode: DeliveryMode,
    timestamp: Option<i64>,
) -> Option<Packet> {
    let Some(type_id) = packet_type_id(type_name) else {
        error!("failed to create packet: unknown packet type name '{type_name}'");
        return None;
    };
    match create_packet(type_id, payload, mode, timestamp) {
        Ok(packet) => Some(packet),
        Err(e) => {
            error!("failed to create '{type_name}' packet: {e}");
            None
        }
    }
}

/// Header-only variant of [`create_packet_by_name`].
pub fn create_empty_packet_by_name(
    type_name: &str,
    mode: DeliveryMode,
    timestamp: Option<i64>,
) -> Option<Packet> {
    let Some(type_id) = packet_type_id(type_name) else {
        error!("failed to create packet: unknown packet type name '{type_name}'");
        return None;
    };
    match create_empty_packet(type_id, mode, timestamp) {
        Ok(packet) => Some(packet),
        Err(e) => {
            error!("failed to create '{type_name}' packet: {e}");
            None
        }
    }
}

/// Splits a frame into header and payload bytes.
///
/// Returns `None` for frames too short to carry the prefix and header, or
/// whose header fails to decode.
pub fn parse_packet(bytes: &[u8]) -> Option<ParsedPacket> {
    if bytes.len() < HEADER_LEN_PREFIX {
        return None;
    }
    let header_len = u32::from_le_bytes(bytes[..HEADER_LEN_PREFIX].try_into().ok()?) as usize;
    let payload_start = HEADER_LEN_PREFIX.checked_add(header_len)?;
    if bytes.len() < payload_start {
        return None;
    }

    let header: PacketHeader =
        rmp_serde::from_slice(&bytes[HEADER_LEN_PREFIX..payload_start]).ok()?;
    Some(ParsedPacket {
        header,
        payload: Bytes::copy_from_slice(&bytes[payload_start..]),
    })
}

/// Decodes a payload, surfacing the error to the caller.
pub fn try_parse_payload<T: DeserializeOwned>(raw: &[u8]) -> Result<T, ProtocolError> {
    Ok(rmp_serde::from_slice(raw)?)
}

/// Decodes a payload, falling back to `T::default()` on failure.
///
/// Decode errors are logged; handlers receive the default value and its
/// `success: false` / empty fields drive the structured failure reply.
pub fn parse_payload<T: DeserializeOwned + Default>(raw: &[u8]) -> T {
    match rmp_serde::from_slice(raw) {
        Ok(value) => value,
        Err(e) => {
            error!("failed to decode packet payload: {e}");
            T::default()
        }
    }
}
