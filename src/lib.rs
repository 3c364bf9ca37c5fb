//! miniblog is a small blog backend: users, posts, and who may touch them.
//!
//! The same business layer is served over gRPC, over HTTP directly, or over
//! HTTP forwarded to the gRPC server.
#![forbid(unsafe_code)]

pub mod authz;
pub mod biz;
pub mod config;
pub mod context;
pub mod crypto;
pub mod errno;
pub mod error;
pub mod handler;
pub mod known;
pub mod model;
pub mod proto;
pub mod rid;
pub mod router;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod token;
pub mod validation;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware as AxumMiddleware};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};

use crate::authz::Authorizer;
use crate::config::{Configuration, StoreDriver};
use crate::crypto::PasswordManager;
use crate::store::memory::MemoryStore;
use crate::store::mysql::{MysqlOptions, MysqlStore};
use crate::store::{IStore, PolicyStore};
use crate::token::TokenManager;

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    token: Option<&str>,
    app: Router,
    method: Method,
    path: &str,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// In-memory state with cheap password hashing.
#[cfg(test)]
pub async fn test_state() -> AppState {
    let memory = Arc::new(MemoryStore::with_default_policies());
    let authz = Arc::new(Authorizer::new(memory.clone()).await.unwrap());
    let passwords = PasswordManager::new(Some(config::Argon2 {
        memory_cost: 8,
        iterations: 1,
        parallelism: 1,
        hash_length: 32,
    }))
    .unwrap();

    let store: Arc<dyn IStore> = memory;
    let tokens = TokenManager::default();

    AppState {
        config: Arc::new(Configuration::default()),
        biz: biz::Biz::new(Arc::clone(&store), tokens.clone(), Arc::clone(&authz), passwords),
        store,
        authz,
        tokens,
        metrics: None,
        shutdown: CancellationToken::new(),
    }
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Configuration>,
    pub store: Arc<dyn IStore>,
    pub authz: Arc<Authorizer>,
    pub tokens: TokenManager,
    pub biz: biz::Biz,
    /// Renders `/metrics` when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Cancelled once the process starts shutting down.
    pub shutdown: CancellationToken,
}

/// Wrap `router` with the middlewares shared by every HTTP surface.
fn with_layers(router: Router) -> Router {
    let middleware = ServiceBuilder::new()
        // Tag each request, echo the id on the response.
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(
                    DefaultMakeSpan::new()
                        .include_headers(true)
                        .level(tracing::Level::INFO),
                )
                .on_request(DefaultOnRequest::new())
                .on_response(
                    DefaultOnResponse::new()
                        .include_headers(true)
                        .latency_unit(LatencyUnit::Micros),
                ),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(10),
        ))
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
        ]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    router.layer(middleware)
}

/// HTTP API served on top of the business layer.
pub fn app(state: AppState) -> Router {
    let router = router::routes(state.clone())
        .route("/metrics", get(router::metrics))
        .fallback(router::fallback)
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track));

    with_layers(router)
}

/// HTTP API forwarded to the gRPC server through `gateway`.
pub fn gateway_app(state: AppState, gateway: router::gateway::Gateway) -> Router {
    let metrics = Router::new()
        .route("/metrics", get(router::metrics))
        .with_state(state);

    let router = router::gateway::router(gateway)
        .merge(metrics)
        .fallback(router::fallback)
        .route_layer(AxumMiddleware::from_fn(telemetry::track));

    with_layers(router)
}

/// Initialize the application state.
pub async fn initialize_state(
    config: Configuration,
    metrics: Option<PrometheusHandle>,
    shutdown: CancellationToken,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let (store, policies): (Arc<dyn IStore>, Arc<dyn PolicyStore>) = match config.store.driver {
        StoreDriver::Mysql => {
            let mysql = MysqlStore::connect(&MysqlOptions {
                address: config.mysql.addr.clone(),
                username: config.mysql.username.clone(),
                password: config.mysql.password.clone(),
                database: config.mysql.database.clone(),
                max_connections: config.mysql.max_connections,
                min_connections: config
                    .mysql
                    .max_idle_connections
                    .min(config.mysql.max_connections),
                max_lifetime: config.mysql.max_connection_life_time,
            })
            .await?;

            // execute migrations scripts on start.
            if let Some(pool) = mysql.pool() {
                sqlx::migrate!().run(pool).await?;
            }

            let mysql = Arc::new(mysql);
            (mysql.clone(), mysql)
        },
        StoreDriver::Memory => {
            tracing::warn!("using the in-memory store, data is lost on exit");
            let memory = Arc::new(MemoryStore::with_default_policies());
            (memory.clone(), memory)
        },
    };

    let authz = Arc::new(Authorizer::new(policies).await?);
    Arc::clone(&authz).spawn_refresher(config.authz.refresh_interval, shutdown.clone());

    let tokens = TokenManager::new(&config.jwt_key, &config.identity_key, config.expiration);
    let passwords = PasswordManager::new(config.argon2.clone())?;

    Ok(AppState {
        biz: biz::Biz::new(Arc::clone(&store), tokens.clone(), Arc::clone(&authz), passwords),
        config: Arc::new(config),
        store,
        authz,
        tokens,
        metrics,
        shutdown,
    })
}
