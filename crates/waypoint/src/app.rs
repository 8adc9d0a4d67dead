//! Application lifecycle: server construction, the bundled arena session
//! type, and graceful shutdown.

use crate::config::AppConfig;
use crate::signals::wait_for_shutdown;
use dashmap::DashMap;
use lobby_server::{
    initialize, session_handler, LoginFn, MainServer, Session, SessionCore, SessionGenerator,
    UdpTransport, UsernameFn,
};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::info;
use waypoint_protocol::{
    create_packet, generate_uuid, register_packet_type, DeliveryMode, LoginData, LoginResult,
    UserIdentifier,
};
use serde::{Deserialize, Serialize};

/// Packet type for in-session chat, the arena session's only traffic.
const CHAT_PACKET: u16 = 1;

/// Chat line broadcast to every member of an arena session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChatMessage {
    user_id: u64,
    message: String,
}

/// The bundled session type: a chat arena ticking at 60 fps.
struct ArenaSession {
    core: SessionCore,
}

impl lobby_server::Session for ArenaSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn tick(&self, _delta_seconds: f64) {}
}

fn arena_generator() -> SessionGenerator {
    Arc::new(|info, option| {
        let session = Arc::new(ArenaSession {
            core: SessionCore::new(info, option, 60.0),
        });

        session.core().register_packet_handler(
            CHAT_PACKET,
            session_handler::<String, _>(|core, uid, message| {
                let line = ChatMessage {
                    user_id: uid,
                    message,
                };
                match create_packet(CHAT_PACKET, &line, DeliveryMode::Reliable, None) {
                    Ok(packet) => {
                        for member in core.members() {
                            core.send_packet_to_uid(member, 0, packet.clone());
                        }
                    }
                    Err(e) => tracing::error!("failed to encode chat broadcast: {e}"),
                }
            }),
        );

        session
    })
}

/// Accepts any non-empty id, derives a stable uid from it, and remembers
/// the name for session listings.
fn demo_login(directory: Arc<DashMap<u64, String>>) -> LoginFn {
    Arc::new(move |data: LoginData| {
        if data.id.is_empty() {
            return LoginResult {
                success: false,
                user_identifier: None,
                error_code: Some(1),
            };
        }

        let mut hasher = DefaultHasher::new();
        data.id.hash(&mut hasher);
        let uid = hasher.finish();
        directory.insert(uid, data.id.clone());

        LoginResult {
            success: true,
            user_identifier: Some(UserIdentifier {
                user_id: uid,
                user_token: generate_uuid(),
            }),
            error_code: None,
        }
    })
}

fn demo_usernames(directory: Arc<DashMap<u64, String>>) -> UsernameFn {
    Arc::new(move |uid| {
        directory
            .get(&uid)
            .map(|name| name.clone())
            .unwrap_or_default()
    })
}

/// The running application: configuration plus the main server.
pub struct Application {
    config: AppConfig,
    server: MainServer,
}

impl Application {
    /// Builds the main server over UDP and registers the arena session
    /// type.
    pub async fn new(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        initialize();
        register_packet_type(CHAT_PACKET, "Chat");

        let directory: Arc<DashMap<u64, String>> = Arc::new(DashMap::new());
        let server = MainServer::new(
            demo_login(directory.clone()),
            demo_usernames(directory),
            config.to_session_server_option(),
            Arc::new(UdpTransport::new()),
            &config.to_main_host_config(),
        )?;
        server.set_timeout(config.server.service_timeout_ms);
        server.register_session_generator("", arena_generator());

        info!("🚀 Waypoint main server listening on port {}", server.port());
        info!(
            "🗺  fleet: up to {} session servers on ports {}..{}",
            config.fleet.max_sessions, config.fleet.port_range_start, config.fleet.port_range_end
        );

        Ok(Self { config, server })
    }

    /// Runs until a termination signal arrives, then stops the whole
    /// fleet.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        wait_for_shutdown().await?;

        info!("🛑 shutting down (main port {})", self.config.server.port);
        self.server.stop().await;
        info!("✅ shutdown complete");
        Ok(())
    }
}
