use std::path::PathBuf;

use clap::Parser;
use miniblog::config::{Configuration, Overrides};
use miniblog::{initialize_state, server, telemetry};
use tokio_util::sync::CancellationToken;

/// miniblog API server.
#[derive(Debug, Parser)]
#[command(name = "mb-apiserver", about, long_about = None)]
struct Cli {
    /// Path to `mb-apiserver.yaml`.
    #[arg(short, long, env = "MINIBLOG_CONFIG")]
    config: Option<PathBuf>,
    #[command(flatten)]
    overrides: Overrides,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logging is not installed yet, report on stderr.
    let config = match Configuration::read(cli.config.as_deref())
        .map(|config| config.merge(cli.overrides))
        .and_then(Configuration::validate)
    {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(1);
        },
    };

    telemetry::setup_logging(&config.log);
    match config.source() {
        Some(path) => tracing::info!(path = %path.display(), "configuration loaded"),
        None => tracing::warn!("no `mb-apiserver.yaml` found, using default configuration"),
    }

    let shutdown = CancellationToken::new();

    let metrics = match telemetry::setup_metrics_recorder() {
        Ok(handle) => {
            telemetry::spawn_process_metrics(shutdown.clone());
            Some(handle)
        },
        Err(err) => {
            tracing::warn!(error = %err, "cannot install prometheus recorder, metrics disabled");
            None
        },
    };

    let state = match initialize_state(config, metrics, shutdown).await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %err, "failed to initialize application state");
            std::process::exit(1);
        },
    };

    if let Err(err) = server::run(state).await {
        tracing::error!(error = %err, "server stopped with an error");
        std::process::exit(1);
    }
}
