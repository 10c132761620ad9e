mod app;
mod model;
mod pipeline;
mod retrieve;
mod sink;

use clap::{Parser, Subcommand};
use ingestor_core::config::TelemetryConfig;
use ingestor_core::{telemetry, Config};
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[clap(name = "ingestor")]
#[clap(about = "Polls an HTTP or SQL source and forwards each batch to a state store or MQTT broker", version)]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Run the ingestion loop until interrupted (default)
    Run,

    /// Run a single cycle and exit non-zero if it failed
    Once,

    /// Validate configuration and print it with secrets redacted
    Check,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Fatal error");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            // Still want the failure on the log
            let _ = telemetry::init(&TelemetryConfig::default());
            return Err(anyhow::anyhow!("Failed to load config: {}", e));
        }
    };

    telemetry::init(&config.telemetry)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => {
            println!("Configuration is valid");
            println!("{:#?}", config);
        }

        Commands::Once => {
            let app = app::App::new(config).await?;
            let outcome = app.run_once().await;
            app.shutdown().await;

            if !outcome.is_success() {
                anyhow::bail!("cycle finished with outcome {}", outcome.as_str());
            }
        }

        Commands::Run => {
            let shutdown = CancellationToken::new();
            spawn_signal_handler(shutdown.clone());

            // Connecting may retry for a while; a signal ends that too
            let app = tokio::select! {
                app = app::App::new(config) => app?,
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested before startup completed");
                    return Ok(());
                }
            };

            app.run_continuous(shutdown).await;
            app.shutdown().await;
        }
    }

    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        shutdown.cancel();
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
