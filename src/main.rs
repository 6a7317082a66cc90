//! Conflux server binary
//!
//! Loads configuration, starts the hub, and serves the agent and submission
//! endpoints until interrupted. Exit codes: 0 on a clean shutdown, 64 for a
//! bad configuration, 69 when the listener cannot bind, 70 for an
//! unrecoverable internal error.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use conflux::api;
use conflux::config::{ConfigError, HubConfig};
use conflux::hub::Hub;

const EXIT_BAD_CONFIG: u8 = 64;
const EXIT_BIND_FAILURE: u8 = 69;
const EXIT_INTERNAL: u8 = 70;

#[derive(Parser)]
#[command(name = "conflux", version, about = "Coordination hub for autonomous agent fleets")]
struct Cli {
    /// Path to a JSON configuration file; development defaults when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(long)]
    listen: Option<String>,

    /// Tracing filter directive
    #[arg(long, default_value = "conflux=info")]
    log_filter: String,
}

fn load_config(cli: &Cli) -> Result<HubConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => HubConfig::load_from_file(path)?,
        None => HubConfig::development(),
    };
    if let Some(listen) = &cli.listen {
        config.listen_address = listen.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let directive = match cli.log_filter.parse() {
        Ok(directive) => directive,
        Err(error) => {
            eprintln!("invalid log filter {:?}: {error}", cli.log_filter);
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "configuration rejected");
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };
    let addr = match config.listen_addr() {
        Ok(addr) => addr,
        Err(error) => {
            error!(%error, "configuration rejected");
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };

    let hub = match Hub::new(config).await {
        Ok(hub) => hub,
        Err(error) => {
            error!(%error, "hub failed to start");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    let (listener, local) = match api::bind(addr).await {
        Ok(bound) => bound,
        Err(error) => {
            error!(%error, %addr, "listener bind failed");
            return ExitCode::from(EXIT_BIND_FAILURE);
        }
    };
    info!(%local, "listening");

    {
        let hub = hub.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                hub.shutdown();
            }
        });
    }

    let router = api::router(hub.clone());
    if let Err(error) = api::serve(listener, router, hub.shutdown_token()).await {
        error!(%error, "server failed");
        return ExitCode::from(EXIT_INTERNAL);
    }

    info!("shutdown complete");
    ExitCode::SUCCESS
}
