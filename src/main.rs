//! Takagi - use GitHub (or Discord) as an OpenID Connect provider.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use takagi::{
    cli::{Cli, Command},
    config::Settings,
    keyset::{JwkSet, KeysetManager},
    server::Server,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Keygen) => run_keygen(),
        Some(Command::Rotate) => run_rotate(&cli),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Print a fresh private JWK Set to stdout.
fn run_keygen() -> ExitCode {
    match JwkSet::generate().and_then(|set| Ok(serde_json::to_string(&set)?)) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Keyset generation failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Replace the managed keyset on disk.
fn run_rotate(cli: &Cli) -> ExitCode {
    let settings = match Settings::load(cli.provider.env_prefix()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let manager = match KeysetManager::from_settings(&settings) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to load keyset: {e}");
            return ExitCode::FAILURE;
        }
    };

    match manager.rotate() {
        Ok(kid) => {
            info!(kid = %kid, "Keyset rotated; all previously issued tokens are now invalid");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Rotation failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the OIDC provider server.
async fn run_server(cli: Cli) -> ExitCode {
    let settings = match Settings::load(cli.provider.env_prefix()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = cli.provider.service_name(),
        host = %settings.host,
        port = settings.port,
        "Starting"
    );

    let server = match Server::new(settings, cli.provider) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
