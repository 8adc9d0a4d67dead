//! Error types and handling for the server core.
//!
//! Only host creation is fatal to the caller. Protocol-level failures are
//! reported to clients in structured replies, and everything else is logged
//! where it happens.

/// Enumeration of possible server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The transport could not create a host (bind failure, port in use,
    /// socket configuration rejected)
    #[error("host creation failed: {0}")]
    HostCreation(String),

    /// Transport-level errors after the host exists
    #[error("transport error: {0}")]
    Transport(String),

    /// Internal server errors
    #[error("internal error: {0}")]
    Internal(String),
}
