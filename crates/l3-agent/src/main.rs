//! L3 agent binary

use l3_agent::{AgentServer, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first (needed for logging settings)
    let (config, config_error) = match Config::load() {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e)),
    };

    let level = config.logging.level.as_deref().unwrap_or("info");
    let format = config.logging.format.as_deref().unwrap_or("text");
    common::logging::init_with(level, format);

    if let Some(e) = config_error {
        tracing::warn!(error = %e, "Configuration error, using default configuration");
    }
    tracing::info!("L3 agent starting");

    let server = AgentServer::bind(config).await?;
    server.run().await?;

    Ok(())
}
