//! Error types for packet encoding and decoding.

/// Enumeration of protocol-level failures.
///
/// Encoding errors are returned to the caller; decoding errors on the
/// receive path are normally logged and absorbed (see
/// [`parse_payload`](crate::packet::parse_payload)), so they only surface
/// through the `try_` variants.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Payload or header serialization failed
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Payload or header deserialization failed
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}
