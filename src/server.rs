//! Listeners of each server mode and their shutdown.

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Identity, Server, ServerTlsConfig};

use crate::config::{ConfigError, ServerMode};
use crate::error::ApiError;
use crate::handler::grpc::Handler;
use crate::proto::MiniBlogServer;
use crate::router::gateway::Gateway;
use crate::{AppState, app, gateway_app};

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("grpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("gateway error: {0}")]
    Gateway(#[from] ApiError),
}

/// Serve `state` in the configured mode until shutdown.
pub async fn run(state: AppState) -> Result<(), ServerError> {
    tokio::spawn(shutdown_signal(state.shutdown.clone()));

    let config = state.config.clone();
    tracing::info!(mode = %config.server_mode, "starting server");

    let result = match config.server_mode {
        ServerMode::Grpc => serve_grpc(state.clone()).await,
        ServerMode::Gin => {
            serve_http(config.http_addr()?, app(state.clone()), state.shutdown.clone()).await
        },
        ServerMode::GrpcGateway => {
            let gateway = Gateway::connect_lazy(config.grpc_addr()?, &config.tls)?;
            let http = serve_http(
                config.http_addr()?,
                gateway_app(state.clone(), gateway),
                state.shutdown.clone(),
            );

            tokio::try_join!(serve_grpc(state.clone()), http).map(|_| ())
        },
    };

    // A failed listener takes the other one and background tasks down.
    state.shutdown.cancel();
    result
}

async fn serve_grpc(state: AppState) -> Result<(), ServerError> {
    let addr = state.config.grpc_addr()?;
    let tls = &state.config.tls;

    let mut builder = Server::builder();
    if tls.use_tls {
        let cert = tokio::fs::read(&tls.cert).await?;
        let key = tokio::fs::read(&tls.key).await?;
        builder =
            builder.tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))?;
    }

    tracing::info!(%addr, tls = tls.use_tls, "grpc server listening");

    let shutdown = state.shutdown.clone();
    builder
        .add_service(MiniBlogServer::new(Handler::new(state)))
        .serve_with_shutdown(addr, shutdown.cancelled_owned())
        .await?;

    tracing::info!("grpc server stopped");
    Ok(())
}

async fn serve_http(
    addr: SocketAddr,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    tracing::info!("http server stopped");
    Ok(())
}

/// Cancel `token` on ctrl-c or SIGTERM.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => return,
    }

    tracing::info!("shutdown signal received, draining connections");
    token.cancel();
}
