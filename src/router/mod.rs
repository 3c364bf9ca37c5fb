//! HTTP surface.
//!
//! `routes` serves the API natively on top of the business layer,
//! [`gateway`] forwards the same routes to the gRPC server.

pub mod gateway;
mod login;
mod middleware;
mod posts;
mod users;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::AppState;
use crate::context::RequestContext;
use crate::errno;
use crate::error::{ApiError, Result};
use crate::validation::{Defaulter, Validate};

/// JSON body, defaulted then validated against the request context.
pub struct Valid<T>(pub T);

impl<S, T> FromRequest<S> for Valid<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate + Defaulter + Send,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let ctx = req
            .extensions()
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default();
        let body = bind(&ctx, Json::<T>::from_request(req, state).await)?;

        checked(&ctx, body).map(Valid)
    }
}

/// Map a JSON decoding failure to `BindError`.
pub(crate) fn bind<T>(
    ctx: &RequestContext,
    body: std::result::Result<Json<T>, JsonRejection>,
) -> Result<T> {
    body.map(|Json(body)| body).map_err(|rejection| {
        errno::ERR_BIND
            .with_message(rejection.body_text())
            .with_request_id(&ctx.request_id)
    })
}

/// Map a query string decoding failure to `BindError`.
pub(crate) fn bind_query<T>(
    ctx: &RequestContext,
    query: std::result::Result<Query<T>, QueryRejection>,
) -> Result<T> {
    query.map(|Query(query)| query).map_err(|rejection| {
        errno::ERR_BIND
            .with_message(rejection.body_text())
            .with_request_id(&ctx.request_id)
    })
}

/// Default then validate a request assembled from several extractors.
pub(crate) fn checked<T: Validate + Defaulter>(ctx: &RequestContext, mut rq: T) -> Result<T> {
    rq.apply_defaults();
    rq.validate(ctx)
        .map_err(|err| err.with_request_id(&ctx.request_id))?;
    Ok(rq)
}

/// Render a business result, tagging errors with the request id.
pub(crate) fn reply<T: Serialize>(
    ctx: &RequestContext,
    result: Result<T>,
) -> std::result::Result<Json<T>, ApiError> {
    result
        .map(Json)
        .map_err(|err| err.with_request_id(&ctx.request_id))
}

async fn healthz() -> impl IntoResponse {
    Json(crate::handler::healthz())
}

/// Prometheus text exposition.
pub(crate) async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub(crate) async fn fallback() -> ApiError {
    errno::ERR_PAGE_NOT_FOUND
}

/// Routes served on top of the business layer.
pub fn routes(state: AppState) -> Router<AppState> {
    // Authenticated then authorized on method and path.
    let protected = Router::new()
        .route("/v1/users", get(users::list))
        .route(
            "/v1/users/{user_id}",
            get(users::get).put(users::update).delete(users::delete),
        )
        .route(
            "/v1/users/{user_id}/change-password",
            put(users::change_password),
        )
        .route("/v1/posts", post(posts::create).get(posts::list).delete(posts::delete))
        .route("/v1/posts/{post_id}", get(posts::get).put(posts::update))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::authz,
        ))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::authn,
        ));

    let authenticated = Router::new()
        .route("/refresh-token", put(login::refresh_token))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::authn,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login::login))
        // Registration, no token yet.
        .route("/v1/users", post(users::create))
        .merge(authenticated)
        .merge(protected)
        .layer(axum::middleware::from_fn_with_state(
            state,
            middleware::context,
        ))
        .layer(axum::middleware::from_fn(middleware::headers))
}
