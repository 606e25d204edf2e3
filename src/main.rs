//! Rolegate - authorization caching gateway

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use rolegate::{cli::Cli, config::Config, server::Gateway, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = cli.port {
        config.port = port;
    }

    let gateway = match Gateway::new(config).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "failed to start gateway");
            return ExitCode::FAILURE;
        }
    };

    match gateway.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "gateway exited with error");
            ExitCode::FAILURE
        }
    }
}
