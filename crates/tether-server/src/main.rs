mod commands;
mod config;
mod dispatcher;
mod drivers;
mod listener;
mod provider;
mod server;
mod statements;

#[cfg(test)]
mod tests;

use anyhow::anyhow;
use clap::Parser;
use config::{Config, LoggingConfig};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tether-server", about = "Remote data access server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.example.toml")]
    config: String,
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| anyhow!("logging.level: {e}"))?;
    let spans = if logging.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(spans)
        .try_init()
        .map_err(|e| anyhow!(e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_path(&args.config)?;
    init_tracing(&config.logging)?;
    server::run(config).await
}
