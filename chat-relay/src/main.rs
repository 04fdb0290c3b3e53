//! Chat Relay - Main entry point.

use anyhow::Result;
use chat_common::config::Config;
use chat_common::logging::init_logging_with_exclusions;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load_with_env()?;

    // Initialize logging
    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    config.validate()?;

    tracing::info!("Chat Relay v{}", env!("CARGO_PKG_VERSION"));

    chat_relay::start_server(&config).await
}
