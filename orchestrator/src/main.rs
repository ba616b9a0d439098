use std::path::PathBuf;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

mod adopt_sync;
mod config;
mod ensure;
mod http_objects;
mod lifecycle_store;
mod ports;
mod reaper;
mod routes;
mod service;
#[cfg(test)]
mod integration_test;
#[cfg(test)]
mod testing;

use service::Service;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let cli = Cli::parse();
    let config = match config::OrchestratorConfig::load(cli.config.as_deref().and_then(|p| p.to_str()))
    {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading config: {err:?}");
            std::process::exit(1);
        }
    };

    let mut service = match Service::new(config) {
        Ok(service) => service,
        Err(err) => {
            error!("Error initializing service: {err:?}");
            std::process::exit(1);
        }
    };
    if let Err(err) = service.start().await {
        error!("Error starting service: {err:?}");
    }
}
