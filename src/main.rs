// src/main.rs

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry};

use ptysup::cli;
use ptysup::cli::Cli;
use ptysup::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli_args.log_level.to_string()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    Registry::default().with(env_filter).with(console_layer).init();

    let config = match Config::load(cli_args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("failed to load configuration: {e}");
            if cli_args.config.is_some() {
                return Err(e);
            }
            tracing::warn!("proceeding with default configuration");
            Config::default()
        }
    };

    cli::handle_command(cli_args, &config).await
}
