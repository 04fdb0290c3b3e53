//! Chat CLI - Main entry point.

use anyhow::Result;
use chat_cli::{App, Cli, ConsoleNotifier};
use chat_common::config::Config;
use chat_common::logging::init_logging_with_exclusions;
use clap::Parser;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from(path)?;
            config.apply_env_overrides();
            config
        }
        None => Config::load_with_env()?,
    };

    // Logs stay quiet unless asked for; replies go to stdout
    let log_level = if cli.verbose {
        "debug"
    } else if std::env::var_os("CHAT_LOG_LEVEL").is_some() {
        config.observability.log_level.as_str()
    } else {
        "warn"
    };
    init_logging_with_exclusions(
        log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    config.validate()?;

    let app = App::from_config(&config, Arc::new(ConsoleNotifier))?;
    let mut stdout = std::io::stdout();

    if !chat_cli::run(&app, cli.command, &mut stdout).await? {
        std::process::exit(1);
    }
    Ok(())
}
