//! Waypoint server entry point.

mod app;
mod cli;
mod config;
mod logging;
mod signals;

use app::Application;
use cli::CliArgs;
use config::AppConfig;
use tracing::error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }

    if let Err(e) = config.validate() {
        return Err(format!("configuration validation failed: {e}").into());
    }

    logging::setup_logging(&config.logging, args.json_logs)?;
    logging::display_banner();

    let app = match Application::new(config).await {
        Ok(app) => app,
        Err(e) => {
            error!("failed to start: {e}");
            return Err(e);
        }
    };

    app.run().await
}
