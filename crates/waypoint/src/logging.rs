//! Logging system setup.
//!
//! Installs the tracing subscriber with the configured filter and either a
//! human-readable or a JSON formatter. The server core's async log relay
//! forwards into whatever subscriber is installed here.

use crate::config::LoggingSettings;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system with the specified configuration.
///
/// Respects `RUST_LOG` when set; `json_format` forces JSON output
/// regardless of the config file.
pub fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(fmt::layer().json().with_file(false).with_line_number(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_ansi(true).with_file(false).with_line_number(false))
            .init();
    }

    info!("🔧 logging initialized with level: {}", config.level);
    Ok(())
}

/// Displays the startup banner.
pub fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════╗");
    info!("║          🛰  WAYPOINT SERVER          ║");
    info!("║              v{version}                  ║");
    info!("║                                      ║");
    info!("║  Session-Fleet Game Server           ║");
    info!("║  🎯 Typed Packet Protocol            ║");
    info!("║  🗺  Dynamic Session Placement        ║");
    info!("║  ⚡ Per-Session Tick Loops           ║");
    info!("╚══════════════════════════════════════╝");
}
