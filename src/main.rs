use std::path::PathBuf;

use ::tracing::{error, info_span};
use clap::Parser;
use service::Service;

mod config;
mod dispatcher;
mod health;
mod http_objects;
mod metrics;
mod pool;
mod proxy_client;
mod registry;
mod retry;
mod routes;
mod runtime;
mod service;
mod tracing;
use tracing::setup_tracing;
mod workflow;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => match config::ServerConfig::from_path(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error loading config {}: {:?}", path.display(), err);
                std::process::exit(1);
            }
        },
        None => config::ServerConfig::default(),
    };

    let tracing_provider = match setup_tracing(&config) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("Error setting up tracing: {:?}", err);
            std::process::exit(1);
        }
    };

    let instance_id = config.instance_id();
    if let Err(err) = metrics::init_provider(&config.telemetry, &instance_id) {
        error!("Error setting up metrics: {:?}", err);
    }

    let root_span = info_span!(
        "warmpool",
        env = config.env,
        "warmpool-instance" = instance_id
    );
    let _guard = root_span.enter();

    let service = match Service::new(config) {
        Ok(service) => service,
        Err(err) => {
            error!("Error creating service: {:?}", err);
            return;
        }
    };
    if let Err(err) = service.start().await {
        error!("Error starting service: {:?}", err);
    }

    // export traces before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
}
