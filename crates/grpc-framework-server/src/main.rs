#![doc = include_str!("../README.md")]

mod config;

use clap::Parser;
use config::CliArgs;
use grpc_framework::config::ServerConfig;
use grpc_framework::server::Server;
use grpc_framework::telemetry::init_telemetry;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let server = Server::new(config);
    server.start().await?;

    shutdown_signal().await;

    let result = server.stop().await;
    match &result {
        Ok(()) => tracing::info!("Service shut down successfully"),
        Err(e) => tracing::error!("Error during service shutdown: {e:?}"),
    }

    providers.shutdown();
    result?;
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting {} on {} with full config: {:#?}",
            config.name(),
            config.address(),
            config
        );
    } else {
        tracing::info!(
            "Starting {} on {} ({})",
            config.name(),
            config.address(),
            config.transport()
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
