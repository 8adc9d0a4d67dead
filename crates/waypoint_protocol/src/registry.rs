//! Process-wide packet type registry.
//!
//! Maps packet type names to 16-bit ids in both directions. The framework's
//! own packet types live at the top of the u16 range and are registered
//! exactly once through [`register_predefined_packet_types`]; applications
//! claim lower ids for their own types at startup. Registration is expected
//! to finish before servers start; the registry is read-mostly afterwards.

use std::collections::HashMap;
use std::sync::{Once, OnceLock, RwLock};

/// Reserved packet type ids, allocated downwards from `u16::MAX`.
pub mod packet_type {
    /// Create a session on the main server
    pub const CREATE_SESSION: u16 = u16::MAX;
    /// Join a session on a session server
    pub const JOIN_SESSION: u16 = u16::MAX - 1;
    /// Authenticate against the main server
    pub const LOGIN: u16 = u16::MAX - 2;
    /// Ask any server what it is
    pub const GET_SERVER_TYPE: u16 = u16::MAX - 3;
    /// List sessions on the main server
    pub const GET_SESSION_LIST: u16 = u16::MAX - 4;
}

#[derive(Default)]
struct RegistryMaps {
    name_to_id: HashMap<String, u16>,
    id_to_name: HashMap<u16, String>,
}

static REGISTRY: OnceLock<RwLock<RegistryMaps>> = OnceLock::new();
static PREDEFINED: Once = Once::new();

fn registry() -> &'static RwLock<RegistryMaps> {
    REGISTRY.get_or_init(|| RwLock::new(RegistryMaps::default()))
}

/// Registers a packet type in both directions.
///
/// Idempotent; re-registering an id or name overwrites the previous mapping
/// in both maps.
pub fn register_packet_type(type_id: u16, type_name: &str) {
    let mut maps = registry().write().expect("packet type registry poisoned");
    maps.name_to_id.insert(type_name.to_string(), type_id);
    maps.id_to_name.insert(type_id, type_name.to_string());
}

/// Registers the framework's reserved packet types. Runs at most once per
/// process; later calls are no-ops.
pub fn register_predefined_packet_types() {
    PREDEFINED.call_once(|| {
        register_packet_type(packet_type::CREATE_SESSION, "CreateSession");
        register_packet_type(packet_type::JOIN_SESSION, "JoinSession");
        register_packet_type(packet_type::LOGIN, "Login");
        register_packet_type(packet_type::GET_SERVER_TYPE, "GetServerType");
        register_packet_type(packet_type::GET_SESSION_LIST, "GetSessionList");
    });
}

/// Looks up the id registered for a type name.
pub fn packet_type_id(type_name: &str) -> Option<u16> {
    let maps = registry().read().expect("packet type registry poisoned");
    maps.name_to_id.get(type_name).copied()
}

/// Looks up the name registered for a type id.
pub fn packet_type_name(type_id: u16) -> Option<String> {
    let maps = registry().read().expect("packet type registry poisoned");
    maps.id_to_name.get(&type_id).cloned()
}
