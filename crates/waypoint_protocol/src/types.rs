//! Wire data model for login, session creation, joining, and listing.
//!
//! Every struct here crosses the wire as a msgpack array in
//! field-declaration order, so field order is part of the protocol and must
//! not be rearranged. All types implement `Default`: when a payload fails to
//! decode, handlers receive the default value, whose `success: false` /
//! empty fields are meaningful to the reply path.

use serde::{Deserialize, Serialize};

/// Frame header carried in front of every payload.
///
/// `timestamp` is milliseconds since the Unix epoch, stamped at encode time.
/// The core never validates it; it is carried for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PacketHeader {
    pub type_id: u16,
    pub timestamp: i64,
}

/// Globally identifies a session: the hosting session-server's port plus the
/// session's slot number on that server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionIdentifier {
    pub session_port: u16,
    pub session_number: u16,
}

/// A logged-in user: 64-bit id plus an opaque token issued by the login
/// predicate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserIdentifier {
    pub user_id: u64,
    pub user_token: String,
}

/// Public description of a live session, as returned by session listings and
/// creation results.
///
/// Invariants maintained by the hosting server: `has_password` mirrors
/// whether a password is configured, and `current_players` always equals the
/// member count and never exceeds `max_players`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub identifier: SessionIdentifier,
    pub max_players: u8,
    pub current_players: u8,
    pub is_private: bool,
    pub has_password: bool,
    pub author_name: String,
    pub session_type: String,
}

/// Parameters of a CreateSession request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionCreationOption {
    pub name: String,
    pub password: Option<String>,
    pub max_players: u8,
    pub is_private: bool,
    pub user_identifier: UserIdentifier,
    pub session_type: String,
}

/// Reply to a CreateSession request.
///
/// `error_code`: 1 = unknown session type, 2 = fleet capacity exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionCreationResult {
    pub success: bool,
    pub error_code: u8,
    pub session_info: Option<SessionInfo>,
}

/// Parameters of a GetSessionList request. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionListOption {
    pub name_filter: Option<String>,
    pub page: u32,
    pub sessions_per_page: u32,
    pub session_type: String,
}

/// Reply to a GetSessionList request. `total_session_count` counts matches
/// before paging.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionListResult {
    pub total_session_count: u32,
    pub sessions: Vec<SessionInfo>,
}

/// Parameters of a JoinSession request, sent to a session-server port.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionJoinOption {
    pub user_identifier: UserIdentifier,
    pub session_number: u16,
    pub password: Option<String>,
}

/// Reply to a JoinSession request. `error_code`: 1 = invalid join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionJoinResult {
    pub success: bool,
    pub error_code: u8,
}

/// Credentials presented to the login predicate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoginData {
    pub id: String,
    pub password: String,
}

/// Reply to a Login request, produced by the user-supplied login predicate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoginResult {
    pub success: bool,
    pub user_identifier: Option<UserIdentifier>,
    pub error_code: Option<u8>,
}

/// Socket buffer sizing presets for host creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferSize {
    /// Leave the OS default in place
    #[default]
    Default,
    /// 256 KiB
    Small,
    /// 512 KiB
    Medium,
    /// 1 MiB
    Large,
}

impl BufferSize {
    /// Buffer size in bytes; `None` keeps the OS default.
    pub fn bytes(self) -> Option<usize> {
        match self {
            BufferSize::Default => None,
            BufferSize::Small => Some(256 * 1024),
            BufferSize::Medium => Some(512 * 1024),
            BufferSize::Large => Some(1024 * 1024),
        }
    }
}
